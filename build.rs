use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

struct ClassDef {
    size: usize,
    batch: usize,
}

/// TLAB refill batch: large for tiny objects, tapering to 1 for the classes
/// that are not TLAB-cached anyway.
fn auto_batch(size: usize) -> usize {
    (8192 / size).clamp(1, 32)
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    superblock_size: Option<usize>,
    emptiness_buckets: Option<usize>,
    num_heaps: Option<usize>,
    max_threads: Option<usize>,
    largest_small: Option<usize>,
    max_cached_per_class: Option<u32>,
    max_cached_bytes_total: Option<usize>,
    retained_empty_per_class: Option<usize>,
    big_retention_percent: Option<usize>,
    big_retention_floor_bytes: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
    #[serde(default, rename = "class")]
    class_full: Vec<ClassFull>,
}

#[derive(Deserialize)]
struct ClassFull {
    size: usize,
    batch: Option<usize>,
}

struct ResolvedConfig {
    superblock_size: usize,
    superblock_shift: u32,
    emptiness_buckets: usize,
    num_heaps: usize,
    max_threads: usize,
    largest_small: usize,
    max_cached_per_class: u32,
    max_cached_bytes_total: usize,
    retained_empty_per_class: usize,
    big_retention_percent: usize,
    big_retention_floor_bytes: usize,
    page_size: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let superblock_size = cfg.superblock_size.unwrap_or(65536);
    assert!(
        superblock_size.is_power_of_two(),
        "superblock_size ({}) must be a power of 2",
        superblock_size
    );
    assert!(
        (16384..=1048576).contains(&superblock_size),
        "superblock_size ({}) out of range",
        superblock_size
    );

    let page_size = cfg.page_size.unwrap_or(4096);
    assert!(
        page_size.is_power_of_two() && page_size >= 4096,
        "page_size ({}) must be a power of 2 and >= 4096",
        page_size
    );
    assert!(
        superblock_size % page_size == 0,
        "superblock_size must be a multiple of page_size"
    );

    let emptiness_buckets = cfg.emptiness_buckets.unwrap_or(8);
    let num_heaps = cfg.num_heaps.unwrap_or(128);
    let max_threads = cfg.max_threads.unwrap_or(2048);
    let largest_small = cfg.largest_small.unwrap_or(1024);
    let max_cached_per_class = cfg.max_cached_per_class.unwrap_or(32);
    let max_cached_bytes_total = cfg.max_cached_bytes_total.unwrap_or(16 * 1024 * 1024);
    let retained_empty_per_class = cfg.retained_empty_per_class.unwrap_or(8);
    let big_retention_percent = cfg.big_retention_percent.unwrap_or(25);
    let big_retention_floor_bytes = cfg.big_retention_floor_bytes.unwrap_or(1024 * 1024);

    assert!(
        emptiness_buckets >= 2,
        "emptiness_buckets ({}) must be >= 2",
        emptiness_buckets
    );
    assert!(
        num_heaps.is_power_of_two(),
        "num_heaps ({}) must be a power of 2",
        num_heaps
    );
    assert!(
        max_threads.is_power_of_two(),
        "max_threads ({}) must be a power of 2",
        max_threads
    );
    assert!(largest_small >= 16, "largest_small must be >= 16");
    assert!(max_cached_per_class > 0, "max_cached_per_class must be > 0");
    assert!(
        max_cached_bytes_total > 0,
        "max_cached_bytes_total must be > 0"
    );
    assert!(
        big_retention_percent > 0 && big_retention_percent <= 100,
        "big_retention_percent ({}) must be in 1..=100",
        big_retention_percent
    );

    ResolvedConfig {
        superblock_size,
        superblock_shift: superblock_size.trailing_zeros(),
        emptiness_buckets,
        num_heaps,
        max_threads,
        largest_small,
        max_cached_per_class,
        max_cached_bytes_total,
        retained_empty_per_class,
        big_retention_percent,
        big_retention_floor_bytes,
        page_size,
    }
}

fn parse_classes(config: &Config) -> Vec<ClassDef> {
    if !config.classes.is_empty() && !config.class_full.is_empty() {
        panic!("MHMALLOC_CONFIG: use either `classes = [...]` or `[[class]]`, not both");
    }

    let defs: Vec<ClassDef> = if !config.classes.is_empty() {
        config
            .classes
            .iter()
            .map(|&s| ClassDef {
                size: s,
                batch: auto_batch(s),
            })
            .collect()
    } else if !config.class_full.is_empty() {
        config
            .class_full
            .iter()
            .map(|c| ClassDef {
                size: c.size,
                batch: c.batch.unwrap_or_else(|| auto_batch(c.size)),
            })
            .collect()
    } else {
        panic!("MHMALLOC_CONFIG: config must contain `classes` or `[[class]]` entries");
    };

    validate_classes(&defs);
    defs
}

fn validate_classes(defs: &[ClassDef]) {
    assert!(!defs.is_empty(), "MHMALLOC_CONFIG: no size classes defined");
    assert!(
        defs.len() < 64,
        "MHMALLOC_CONFIG: too many classes ({}, max 63)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.size > 0, "class {}: size must be > 0", i);
        assert!(
            d.size % 16 == 0,
            "class {}: size {} must be 16-byte aligned",
            i,
            d.size
        );
        assert!(d.batch > 0, "class {}: batch must be > 0", i);
        if i > 0 {
            assert!(
                d.size > defs[i - 1].size,
                "class {}: size {} must be > previous size {}",
                i,
                d.size,
                defs[i - 1].size
            );
        }
    }
}

fn validate_against_config(defs: &[ClassDef], cfg: &ResolvedConfig) {
    // The superblock header occupies the front of each superblock; every class
    // must still leave room for at least one slot.
    let header_upper_bound = 128;
    let largest = defs.last().unwrap().size;
    assert!(
        largest + header_upper_bound <= cfg.superblock_size,
        "largest class ({}) does not fit in a superblock of {} bytes",
        largest,
        cfg.superblock_size
    );
    assert!(
        defs.iter().any(|d| d.size == cfg.largest_small),
        "largest_small ({}) must be an exact class size",
        cfg.largest_small
    );
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/mhmalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const SUPERBLOCK_SIZE: usize = {};\n\
         pub const SUPERBLOCK_SHIFT: usize = {};\n\
         pub const EMPTINESS_BUCKETS: usize = {};\n\
         pub const NUM_HEAPS: usize = {};\n\
         pub const MAX_THREADS: usize = {};\n\
         pub const LARGEST_SMALL: usize = {};\n\
         pub const MAX_CACHED_PER_CLASS: u32 = {};\n\
         pub const MAX_CACHED_BYTES_TOTAL: usize = {};\n\
         pub const RETAINED_EMPTY_PER_CLASS: usize = {};\n\
         pub const BIG_RETENTION_PERCENT: usize = {};\n\
         pub const BIG_RETENTION_FLOOR_BYTES: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n",
        cfg.superblock_size,
        cfg.superblock_shift,
        cfg.emptiness_buckets,
        cfg.num_heaps,
        cfg.max_threads,
        cfg.largest_small,
        cfg.max_cached_per_class,
        cfg.max_cached_bytes_total,
        cfg.retained_empty_per_class,
        cfg.big_retention_percent,
        cfg.big_retention_floor_bytes,
        cfg.page_size,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!(
        "pub(crate) const SIZE_CLASS_TABLE: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, batch: 0 }}, // sentinel\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, batch: {} }},\n",
            d.size, d.batch
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=MHMALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("MHMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config);
    validate_against_config(&defs, &resolved);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}

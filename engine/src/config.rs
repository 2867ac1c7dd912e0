//! Environment-derived configuration
//!
//! | variable | effect |
//! |---|---|
//! | `TPI_OUTPUT` | plugin output goes to `<path>.<pid>` instead of stderr |
//! | `TPI_LOW_PC` | inclusive lower bound of instrumented addresses |
//! | `TPI_HIGH_PC` | exclusive upper bound of instrumented addresses |
//! | `TPI_MUTEX_PROTECTED` | serialize data-collection callbacks (default on) |
//! | `TPI_VERBOSE` | describe the negotiated descriptor at load time |
//! | `TPI_SYMBOL_PC` | recognized, not supported yet |
//! | `TPI_PLUGIN_DIR` | root of installed plugins used for short names |
//!
//! Addresses follow C `strtoull(s, NULL, 0)` rules: `0x` prefix for hex, a
//! leading `0` for octal, decimal otherwise.

use std::path::PathBuf;

/// Installed plugin root when `TPI_PLUGIN_DIR` is not set at run time.
pub const DEFAULT_PLUGIN_DIR: &str = match option_env!("TPI_PLUGIN_DIR") {
    Some(dir) => dir,
    None => "/usr/local/libexec/tpi",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Base path of the plugin output file; the pid is appended when opened
    pub output_path: Option<PathBuf>,
    pub low_pc: u64,
    pub high_pc: u64,
    pub mutex_protected: bool,
    pub verbose: bool,
    pub symbol_pc: Option<String>,
    pub plugin_dir: PathBuf,
    /// Fallbacks taken while parsing, reported on the plugin output once it
    /// is open
    pub warnings: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            low_pc: 0,
            high_pc: u64::MAX,
            mutex_protected: true,
            verbose: false,
            symbol_pc: None,
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            warnings: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("TPI_OUTPUT").filter(|p| !p.is_empty()) {
            config.output_path = Some(PathBuf::from(path));
        }

        if let Some(symbol) = lookup("TPI_SYMBOL_PC") {
            config.symbol_pc = Some(symbol);
            config
                .warnings
                .push("TPI_SYMBOL_PC parameter not supported yet".to_string());
        }

        if let Some(value) = lookup("TPI_LOW_PC") {
            match parse_c_integer(&value) {
                Some(low) => config.low_pc = low,
                None => config
                    .warnings
                    .push("can't parse TPI_LOW_PC (fall back to 0)".to_string()),
            }
        }

        if let Some(value) = lookup("TPI_HIGH_PC") {
            match parse_c_integer(&value).filter(|&high| high != 0) {
                Some(high) => config.high_pc = high,
                None => config
                    .warnings
                    .push("can't parse TPI_HIGH_PC (fall back to UINT64_MAX)".to_string()),
            }
        }

        if let Some(value) = lookup("TPI_MUTEX_PROTECTED") {
            config.mutex_protected = parse_toggle(&value);
        }

        if let Some(value) = lookup("TPI_VERBOSE") {
            config.verbose = parse_toggle(&value);
        }

        if let Some(dir) = lookup("TPI_PLUGIN_DIR").filter(|d| !d.is_empty()) {
            config.plugin_dir = PathBuf::from(dir);
        }

        config
    }
}

/// Parse an unsigned integer the way `strtoull(s, NULL, 0)` does, but reject
/// trailing garbage instead of silently truncating.
pub fn parse_c_integer(text: &str) -> Option<u64> {
    let text = text.trim();
    let text = text.strip_prefix('+').unwrap_or(text);

    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };

    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

/// Any value enables a toggle except the usual spellings of "off".
fn parse_toggle(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

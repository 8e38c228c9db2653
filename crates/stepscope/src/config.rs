//! Runtime configuration for the execution service.
//!
//! Every limit is adjustable through the environment so deployments can tune
//! the sandbox without rebuilding. `Config::default()` carries the values the
//! service ships with; `Config::from_env()` layers environment overrides on
//! top of those defaults.

use std::env;

/// Resource ceilings and sandbox policy for the execution service.
///
/// The environment variable for each field is its name in SCREAMING_SNAKE_CASE
/// (e.g. `MAX_EXECUTION_TIME`). List-valued fields take a comma-separated
/// string.
#[derive(Debug, Clone)]
pub struct Config {
    /// Wall-clock ceiling per execution, in seconds.
    pub max_execution_time: u64,
    /// Guest heap memory ceiling, in megabytes.
    pub max_memory_mb: usize,
    /// Maximum length of the scripted-input string, in characters.
    pub max_output_length: usize,
    /// Maximum guest source length, in characters.
    pub max_code_length: usize,
    /// Maximum number of visible trace steps per execution.
    pub max_steps: u32,
    /// Number of worker threads in the execution pool.
    pub workers: usize,
    /// Builtin names exposed to guest code.
    pub allowed_builtins: Vec<String>,
    /// Module roots whose import is a security violation.
    pub blocked_modules: Vec<String>,
    /// Module roots importable without a "suspicious import" log entry.
    pub allowed_modules: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_execution_time: 10,
            max_memory_mb: 256,
            max_output_length: 10_000,
            max_code_length: 50_000,
            max_steps: 1000,
            workers: 4,
            allowed_builtins: to_strings(&[
                "abs", "all", "any", "bin", "bool", "chr", "dict", "divmod", "enumerate", "filter", "float", "hex",
                "input", "int", "isinstance", "len", "list", "map", "max", "min", "oct", "ord", "pow", "print",
                "range", "repr", "reversed", "round", "set", "sorted", "str", "sum", "tuple", "type", "zip",
            ]),
            blocked_modules: to_strings(&[
                "os",
                "sys",
                "subprocess",
                "importlib",
                "builtins",
                "socket",
                "urllib",
                "http",
                "ftplib",
                "smtplib",
                "email",
                "ctypes",
                "mmap",
                "resource",
                "gc",
                "inspect",
                "threading",
                "multiprocessing",
                "asyncio",
                "concurrent",
            ]),
            allowed_modules: to_strings(&[
                "math",
                "random",
                "itertools",
                "functools",
                "collections",
                "string",
                "statistics",
                "json",
            ]),
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment.
    ///
    /// Unset or unparsable variables keep their default value.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        read_parsed(&mut config.max_execution_time, "MAX_EXECUTION_TIME");
        read_parsed(&mut config.max_memory_mb, "MAX_MEMORY_MB");
        read_parsed(&mut config.max_output_length, "MAX_OUTPUT_LENGTH");
        read_parsed(&mut config.max_code_length, "MAX_CODE_LENGTH");
        read_parsed(&mut config.max_steps, "MAX_STEPS");
        read_parsed(&mut config.workers, "WORKERS");
        read_list(&mut config.allowed_builtins, "ALLOWED_BUILTINS");
        read_list(&mut config.blocked_modules, "BLOCKED_MODULES");
        read_list(&mut config.allowed_modules, "ALLOWED_MODULES");
        config
    }

    /// Guest heap memory ceiling in bytes.
    #[must_use]
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb * 1024 * 1024
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|&n| n.to_owned()).collect()
}

fn read_parsed<T: std::str::FromStr>(slot: &mut T, name: &str) {
    if let Ok(raw) = env::var(name)
        && let Ok(value) = raw.trim().parse()
    {
        *slot = value;
    }
}

fn read_list(slot: &mut Vec<String>, name: &str) {
    if let Ok(raw) = env::var(name) {
        let values: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if !values.is_empty() {
            *slot = values;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = Config::default();
        assert_eq!(config.max_execution_time, 10);
        assert_eq!(config.max_steps, 1000);
        assert_eq!(config.max_memory_bytes(), 256 * 1024 * 1024);
        assert!(config.allowed_builtins.iter().any(|b| b == "print"));
        assert!(config.blocked_modules.iter().any(|m| m == "os"));
    }

    #[test]
    fn env_overrides_scalars_and_lists() {
        // Env mutation is process-global; keep every env-dependent assertion in
        // this single test to avoid ordering hazards.
        unsafe {
            env::set_var("MAX_STEPS", "25");
            env::set_var("ALLOWED_BUILTINS", "print, len ,abs");
            env::set_var("WORKERS", "not-a-number");
        }
        let config = Config::from_env();
        assert_eq!(config.max_steps, 25);
        assert_eq!(config.allowed_builtins, vec!["print", "len", "abs"]);
        assert_eq!(config.workers, Config::default().workers);
        unsafe {
            env::remove_var("MAX_STEPS");
            env::remove_var("ALLOWED_BUILTINS");
            env::remove_var("WORKERS");
        }
    }
}

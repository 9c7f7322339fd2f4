use std::path::PathBuf;

/// Broker configuration, parsed from the CLI. Kept independent of `clap` so tests can
/// construct it directly without going through argument parsing.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "0.0.0.0".to_string(),
            port: 13248,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_interface() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 13248);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }
}

//! INI file configuration adapter. Used for process settings and for
//! strategy program files alike.

use crate::domain::error::LifecycleError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LifecycleError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|reason| LifecycleError::ConfigParse {
                file: path.display().to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, String> {
        let mut config = Ini::new();
        config.read(content.to_string())?;
        Ok(Self { config })
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value.to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.config
            .getint(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.config
            .getfloat(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.config
            .get(section, key)
            .as_ref()
            .and_then(|v| Self::parse_bool(v))
            .unwrap_or(default)
    }

    fn sections(&self) -> Vec<String> {
        let mut sections = self.config.sections();
        sections.sort();
        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[postgres]
connection_string = host=localhost dbname=test

[queue]
lease_secs = 300
max_retries = 3

[strategy]
name = Opening Range Breakout
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(
            adapter.get_string("postgres", "connection_string"),
            Some("host=localhost dbname=test".to_string())
        );
        assert_eq!(
            adapter.get_string("strategy", "name"),
            Some("Opening Range Breakout".to_string())
        );
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter = FileConfigAdapter::from_string("[queue]\nlease_secs = 100\n").unwrap();
        assert_eq!(adapter.get_string("queue", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn get_int_returns_value() {
        let adapter = FileConfigAdapter::from_string("[queue]\nmax_retries = 5\n").unwrap();
        assert_eq!(adapter.get_int("queue", "max_retries", 0), 5);
    }

    #[test]
    fn get_int_returns_default_for_missing() {
        let adapter = FileConfigAdapter::from_string("[queue]\n").unwrap();
        assert_eq!(adapter.get_int("queue", "missing", 42), 42);
    }

    #[test]
    fn get_int_returns_default_for_non_numeric() {
        let adapter = FileConfigAdapter::from_string("[queue]\nmax_retries = abc\n").unwrap();
        assert_eq!(adapter.get_int("queue", "max_retries", 42), 42);
    }

    #[test]
    fn get_double_returns_value() {
        let adapter =
            FileConfigAdapter::from_string("[risk]\nmax_notional = 100000.5\n").unwrap();
        assert_eq!(adapter.get_double("risk", "max_notional", 0.0), 100000.5);
    }

    #[test]
    fn get_double_returns_default_for_non_numeric() {
        let adapter =
            FileConfigAdapter::from_string("[risk]\nmax_notional = not_a_number\n").unwrap();
        assert_eq!(adapter.get_double("risk", "max_notional", 99.9), 99.9);
    }

    #[test]
    fn get_bool_accepts_common_spellings() {
        let adapter = FileConfigAdapter::from_string(
            "[risk]\na = true\nb = yes\nc = 1\nd = false\ne = no\nf = 0\n",
        )
        .unwrap();
        assert!(adapter.get_bool("risk", "a", false));
        assert!(adapter.get_bool("risk", "b", false));
        assert!(adapter.get_bool("risk", "c", false));
        assert!(!adapter.get_bool("risk", "d", true));
        assert!(!adapter.get_bool("risk", "e", true));
        assert!(!adapter.get_bool("risk", "f", true));
    }

    #[test]
    fn get_bool_returns_default_for_missing() {
        let adapter = FileConfigAdapter::from_string("[risk]\n").unwrap();
        assert!(adapter.get_bool("risk", "missing", true));
        assert!(!adapter.get_bool("risk", "missing", false));
    }

    #[test]
    fn sections_are_lowercased_and_sorted() {
        let adapter = FileConfigAdapter::from_string(
            "[Transition.Enter]\nfrom = A\n[strategy]\nname = x\n[feature.sma_fast]\nkind = sma\n",
        )
        .unwrap();
        assert_eq!(
            adapter.sections(),
            vec!["feature.sma_fast", "strategy", "transition.enter"]
        );
    }

    #[test]
    fn from_file_reads_config() {
        let content = "[orchestrator]\ndata_dir = /var/lib/bars\n";
        let file = create_temp_config(content);
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("orchestrator", "data_dir"),
            Some("/var/lib/bars".to_string())
        );
    }

    #[test]
    fn from_file_reports_missing_file() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/config.ini");
        match result {
            Err(LifecycleError::ConfigParse { file, .. }) => {
                assert_eq!(file, "/nonexistent/path/config.ini");
            }
            Err(other) => panic!("expected ConfigParse, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}

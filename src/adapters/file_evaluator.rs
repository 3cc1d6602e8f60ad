//! Evaluator backed by recommendation files dropped into a directory.
//!
//! An external process writes `<dir>/<strategy_id>.json`; a missing file
//! means keep. With `consume` set the file is removed once read so each
//! recommendation is acted on at most once.

use crate::domain::error::LifecycleError;
use crate::domain::evaluation::{Evaluation, EvaluationRequest};
use crate::ports::evaluator_port::Evaluator;
use log::{debug, info};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

pub struct FileEvaluator {
    dir: PathBuf,
    consume: bool,
}

impl FileEvaluator {
    pub fn new(dir: PathBuf, consume: bool) -> Self {
        FileEvaluator { dir, consume }
    }

    fn path_for(&self, strategy_id: i64) -> PathBuf {
        self.dir.join(format!("{strategy_id}.json"))
    }
}

impl Evaluator for FileEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation, LifecycleError> {
        let path = self.path_for(request.strategy_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no recommendation file for strategy {}", request.strategy_id);
                return Ok(Evaluation::keep("no recommendation"));
            }
            Err(e) => return Err(e.into()),
        };

        let evaluation: Evaluation =
            serde_json::from_str(&content).map_err(|e| LifecycleError::Serialization {
                reason: format!("{}: {e}", path.display()),
            })?;

        if self.consume {
            fs::remove_file(&path)?;
        }
        info!(
            "[strategy {} {}] recommendation {:?} (confidence {:.2}) from {}",
            request.strategy_id,
            request.symbol,
            evaluation.recommendation,
            evaluation.confidence,
            path.display()
        );
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evaluation::Recommendation;
    use crate::domain::program::StrategyProgram;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn request(id: i64) -> EvaluationRequest {
        EvaluationRequest {
            strategy_id: id,
            name: "breakout".into(),
            symbol: "SPY".into(),
            timeframe: "1m".into(),
            state: "idle".into(),
            bar_count: 12,
            features: BTreeMap::new(),
            net_quantity: 0.0,
            program: StrategyProgram {
                states: vec!["idle".into()],
                initial_state: "idle".into(),
                features: vec![],
                transitions: vec![],
                history_limit: 100,
            },
        }
    }

    #[test]
    fn missing_file_means_keep() {
        let dir = TempDir::new().unwrap();
        let evaluator = FileEvaluator::new(dir.path().to_path_buf(), true);
        let evaluation = evaluator.evaluate(&request(7)).unwrap();
        assert_eq!(evaluation.recommendation, Recommendation::Keep);
    }

    #[test]
    fn consumed_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("7.json");
        fs::write(
            &path,
            r#"{"recommendation":"close","confidence":0.9,"reason":"drawdown"}"#,
        )
        .unwrap();
        let evaluator = FileEvaluator::new(dir.path().to_path_buf(), true);

        let evaluation = evaluator.evaluate(&request(7)).unwrap();
        assert_eq!(evaluation.recommendation, Recommendation::Close);
        assert!(!path.exists());

        let again = evaluator.evaluate(&request(7)).unwrap();
        assert_eq!(again.recommendation, Recommendation::Keep);
    }

    #[test]
    fn kept_file_is_read_again() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("3.json"),
            r#"{"recommendation":"close","confidence":0.6}"#,
        )
        .unwrap();
        let evaluator = FileEvaluator::new(dir.path().to_path_buf(), false);
        evaluator.evaluate(&request(3)).unwrap();
        let evaluation = evaluator.evaluate(&request(3)).unwrap();
        assert_eq!(evaluation.recommendation, Recommendation::Close);
        assert!(evaluation.reason.is_empty());
    }

    #[test]
    fn malformed_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("4.json"), "{not json").unwrap();
        let evaluator = FileEvaluator::new(dir.path().to_path_buf(), true);
        assert!(matches!(
            evaluator.evaluate(&request(4)),
            Err(LifecycleError::Serialization { .. })
        ));
        assert!(dir.path().join("4.json").exists());
    }
}

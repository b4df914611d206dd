//! Periodic and final checkpoints of every trainer.
//!
//! Layout under the run directory:
//!
//! ```text
//! checkpoints/checkpoints-00010/agent_0/...
//! checkpoints/checkpoints-final/agent_0/...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::config::RunPaths;
use super::training::trainer::AgentTrainer;
use crate::error::TrainError;

/// Writes and restores trainer checkpoints for one run.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    paths: RunPaths,
    save_interval: usize,
    is_writer: bool,
}

impl Checkpointer {
    /// `is_writer` is true only on the coordinating worker (rank 0).
    pub fn new(paths: RunPaths, save_interval: usize, is_writer: bool) -> Self {
        Self {
            paths,
            save_interval,
            is_writer,
        }
    }

    /// Periodic save due after `epoch` (a zero interval disables them).
    pub fn should_save(&self, epoch: usize) -> bool {
        self.save_interval > 0 && epoch % self.save_interval == 0
    }

    /// Saves all trainers under `checkpoints-<epoch>` if one is due.
    ///
    /// Returns the directory written, if any.
    pub fn maybe_save<T: AgentTrainer>(
        &self,
        epoch: usize,
        trainers: &[T],
    ) -> Result<Option<PathBuf>, TrainError> {
        if !self.is_writer || !self.should_save(epoch) {
            return Ok(None);
        }
        let dir = self.paths.epoch_checkpoint_dir(epoch);
        save_all(&dir, trainers)?;
        info!(epoch, dir = %dir.display(), "saved checkpoint");
        Ok(Some(dir))
    }

    /// Saves all trainers under `checkpoints-final`.
    pub fn save_final<T: AgentTrainer>(&self, trainers: &[T]) -> Result<Option<PathBuf>, TrainError> {
        if !self.is_writer {
            return Ok(None);
        }
        let dir = self.paths.final_checkpoint_dir();
        save_all(&dir, trainers)?;
        info!(dir = %dir.display(), "saved final checkpoint");
        Ok(Some(dir))
    }
}

/// Directory of agent `index` inside a checkpoint.
pub fn agent_dir(checkpoint: &Path, index: usize) -> PathBuf {
    checkpoint.join(format!("agent_{}", index))
}

fn save_all<T: AgentTrainer>(dir: &Path, trainers: &[T]) -> Result<(), TrainError> {
    for (i, trainer) in trainers.iter().enumerate() {
        let agent = agent_dir(dir, i);
        fs::create_dir_all(&agent)?;
        trainer.save(&agent)?;
    }
    Ok(())
}

/// Restores every trainer from `checkpoint/agent_<i>`.
pub fn load_all<T: AgentTrainer>(checkpoint: &Path, trainers: &mut [T]) -> Result<(), TrainError> {
    if !checkpoint.is_dir() {
        return Err(TrainError::CheckpointNotFound(checkpoint.to_path_buf()));
    }
    for (i, trainer) in trainers.iter_mut().enumerate() {
        let agent = agent_dir(checkpoint, i);
        if !agent.is_dir() {
            return Err(TrainError::CheckpointNotFound(agent));
        }
        trainer.load(&agent)?;
    }
    info!(dir = %checkpoint.display(), agents = trainers.len(), "restored checkpoint");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::algorithms::rl::training::trainer::{ActionOutput, TrainLosses};
    use crate::algorithms::rl::types::Transition;

    /// Persists a single counter as text.
    #[derive(Default)]
    struct CounterTrainer {
        value: u32,
    }

    impl AgentTrainer for CounterTrainer {
        fn step(&mut self, _obs: &[f32], _noise: bool, _q: bool) -> Result<ActionOutput, TrainError> {
            Ok(ActionOutput {
                action: vec![0.0],
                q: None,
            })
        }
        fn store_transition(&mut self, _t: Transition) {}
        fn memory_len(&self) -> usize {
            0
        }
        fn train(&mut self) -> Result<TrainLosses, TrainError> {
            Ok(TrainLosses {
                critic_loss: 0.0,
                actor_loss: 0.0,
            })
        }
        fn update_target_net(&mut self) {}
        fn adapt_param_noise(&mut self) -> Result<Option<f64>, TrainError> {
            Ok(None)
        }
        fn reset(&mut self) {}
        fn stats(&mut self) -> Result<BTreeMap<String, f64>, TrainError> {
            Ok(BTreeMap::new())
        }
        fn save(&self, dir: &Path) -> Result<(), TrainError> {
            fs::write(dir.join("value.txt"), self.value.to_string())?;
            Ok(())
        }
        fn load(&mut self, dir: &Path) -> Result<(), TrainError> {
            let raw = fs::read_to_string(dir.join("value.txt"))?;
            self.value = raw.trim().parse().unwrap_or_default();
            Ok(())
        }
    }

    #[test]
    fn save_interval_schedule() {
        let paths = RunPaths::new("results", "run");
        let every_two = Checkpointer::new(paths.clone(), 2, true);
        assert!(!every_two.should_save(1));
        assert!(every_two.should_save(2));
        assert!(every_two.should_save(4));
        let never = Checkpointer::new(paths, 0, true);
        assert!(!never.should_save(0));
        assert!(!never.should_save(10));
    }

    #[test]
    fn save_then_load_restores_each_agent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), "run");
        let checkpointer = Checkpointer::new(paths.clone(), 1, true);
        let trainers = vec![CounterTrainer { value: 3 }, CounterTrainer { value: 7 }];

        let written = checkpointer.maybe_save(1, &trainers).unwrap().unwrap();
        assert_eq!(written, paths.epoch_checkpoint_dir(1));
        assert!(written.ends_with("checkpoints/checkpoints-00001"));
        assert!(agent_dir(&written, 1).join("value.txt").exists());

        let mut restored = vec![CounterTrainer::default(), CounterTrainer::default()];
        load_all(&written, &mut restored).unwrap();
        assert_eq!(restored[0].value, 3);
        assert_eq!(restored[1].value, 7);
    }

    #[test]
    fn non_writer_never_saves() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), "run");
        let checkpointer = Checkpointer::new(paths.clone(), 1, false);
        let trainers = vec![CounterTrainer::default()];
        assert_eq!(checkpointer.maybe_save(1, &trainers).unwrap(), None);
        assert_eq!(checkpointer.save_final(&trainers).unwrap(), None);
        assert!(!paths.checkpoints_dir().exists());
    }

    #[test]
    fn loading_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainers = vec![CounterTrainer::default()];
        let err = load_all(&dir.path().join("nope"), &mut trainers).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointNotFound(_)));
    }
}

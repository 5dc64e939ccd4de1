use crate::{common::*, config::LoadCheckpoint};

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_\d{6}_\d+\.\d+\.ckpt$")
        .unwrap()
});

/// Save parameters to a checkpoint file named after the epoch and the score.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    epoch: usize,
    score: f64,
) -> Result<PathBuf> {
    let filename = format!(
        "{}_{:06}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        epoch,
        score
    );
    let path = checkpoint_dir.join(filename);
    vs.save(&path)?;
    Ok(path)
}

/// Locate the checkpoint file selected by the loading method.
///
/// `FromRecent` scans `<logging_dir>/*/checkpoints/` and picks the file with
/// the latest timestamp in its name.
pub fn find_checkpoint(
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let paths: Vec<_> =
                glob::glob(&format!("{}/*/checkpoints/*.ckpt", logging_dir.display()))?
                    .try_collect()?;
            let checkpoint_file = paths
                .into_iter()
                .filter_map(|path| {
                    let file_name = path.file_name()?.to_str()?;
                    let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
                    let datetime_str = captures.get(1)?.as_str();
                    let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
                    Some((path, datetime))
                })
                .max_by_key(|(_path, datetime)| *datetime)
                .map(|(path, _datetime)| path);

            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }

            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "{} is not a file", file.display());
            Some(file.to_owned())
        }
    };

    Ok(path)
}

/// Load parameters with specified checkpoint loading method.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = find_checkpoint(logging_dir, load_checkpoint)?;

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        vs.load_partial(path)?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_from_recent_checkpoint() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;
        let checkpoint_dir = logging_dir.path().join("run").join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;

        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().zeros("weight", &[4]);

        let older = save_checkpoint(&vs, &checkpoint_dir, 0, 1.25)?;
        thread::sleep(Duration::from_millis(10));
        tch::no_grad(|| {
            let _ = weight.shallow_clone().fill_(3.0);
        });
        let newer = save_checkpoint(&vs, &checkpoint_dir, 1, 1.5)?;
        assert_ne!(older, newer);

        let mut restored = nn::VarStore::new(Device::Cpu);
        let restored_weight = restored.root().zeros("weight", &[4]);
        let loaded =
            try_load_checkpoint(&mut restored, logging_dir.path(), &LoadCheckpoint::FromRecent)?;

        assert_eq!(loaded, Some(newer));
        let values: Vec<f32> = restored_weight.into();
        assert_eq!(values, vec![3.0; 4]);
        Ok(())
    }

    #[test]
    fn missing_checkpoints() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;

        assert_eq!(
            find_checkpoint(logging_dir.path(), &LoadCheckpoint::FromRecent)?,
            None
        );
        assert_eq!(
            find_checkpoint(logging_dir.path(), &LoadCheckpoint::Disabled)?,
            None
        );
        let file = logging_dir.path().join("missing.ckpt");
        assert!(find_checkpoint(logging_dir.path(), &LoadCheckpoint::FromFile { file }).is_err());
        Ok(())
    }
}

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::debug;

use crate::{
    atomic,
    process::{CmdOutput, CommandRunner},
};

pub type Result<T> = std::result::Result<T, RebuildError>;

/// FAT32 volume labels are at most 11 ASCII characters.
pub const FAT_LABEL_MAX: usize = 11;

#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum RebuildError {
    #[error("volume label `{0}` must be at most 11 ASCII characters")]
    InvalidLabel(String),
    #[error("master directory `{}` does not exist", .0.display())]
    MasterDirMissing(PathBuf),
    #[error("{step} failed: {detail}")]
    Command { step: &'static str, detail: String },
    #[error("failed promoting the rebuilt image")]
    Promote(#[source] io::Error),
    #[error("failed inspecting the master directory")]
    MasterDir(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct RebuildConfig {
    pub master_dir: PathBuf,
    pub slot_size_mb: u64,
    pub tmp_suffix: String,
    pub volume_label: String,
}

/// Builds a fresh FAT32 image of the master directory and atomically promotes
/// it over the rebuild-slot path.
pub struct RebuildEngine {
    config: RebuildConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RebuildEngine {
    pub fn new(config: RebuildConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let label = &config.volume_label;
        if label.len() > FAT_LABEL_MAX || !label.is_ascii() {
            return Err(RebuildError::InvalidLabel(label.clone()));
        }
        Ok(Self { config, runner })
    }

    pub fn master_dir(&self) -> &Path {
        &self.config.master_dir
    }

    /// One full rebuild into `target`.
    ///
    /// The image is staged at `<target><tmp-suffix>` and only the final
    /// rename makes it visible, after both the file and its directory have
    /// been fsynced. A failed attempt never leaves the temporary behind.
    pub fn full_rebuild(&self, target: &Path) -> Result<()> {
        if !self.config.master_dir.is_dir() {
            return Err(RebuildError::MasterDirMissing(self.config.master_dir.clone()));
        }

        let tmp = self.tmp_path(target);
        let _ = fs::remove_file(&tmp);

        let result = self.build_and_promote(&tmp, target);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn build_and_promote(&self, tmp: &Path, target: &Path) -> Result<()> {
        let tmp_str = tmp.display().to_string();
        let size = format!("{}M", self.config.slot_size_mb);
        self.run("truncate", &["-s", &size, &tmp_str])?;
        self.run(
            "mkfs.vfat",
            &["-F", "32", "-n", &self.config.volume_label, &tmp_str],
        )?;

        if self.master_has_content()? {
            let source = format!("{}/", self.config.master_dir.display());
            self.run("mcopy", &["-s", "-i", &tmp_str, &source, "::"])?;
        } else {
            debug!("master directory is empty, leaving the image blank");
        }

        fs::File::open(tmp)
            .and_then(|file| file.sync_all())
            .map_err(RebuildError::Promote)?;
        fs::File::open(atomic::parent_dir(tmp))
            .and_then(|dir| dir.sync_all())
            .map_err(RebuildError::Promote)?;
        fs::rename(tmp, target).map_err(RebuildError::Promote)?;
        Ok(())
    }

    /// Advisory check whether the master differs from an already mounted
    /// target directory. Not part of the rebuild path.
    pub fn dry_run_diff(&self, target_dir: &Path) -> Result<bool> {
        let source = format!("{}/", self.config.master_dir.display());
        let dest = format!("{}/", target_dir.display());
        let output = self.runner.run(
            "rsync",
            &["-a", "--delete", "--dry-run", "--itemize-changes", &source, &dest],
        );
        if !output.success() {
            return Err(RebuildError::Command {
                step: "rsync",
                detail: output.detail(),
            });
        }
        Ok(!output.stdout.trim().is_empty())
    }

    fn run(&self, step: &'static str, args: &[&str]) -> Result<CmdOutput> {
        let program = resolve_binary(step);
        let output = self.runner.run(&program, args);
        if output.success() {
            debug!(step, "rebuild step done");
            Ok(output)
        } else {
            Err(RebuildError::Command {
                step,
                detail: output.detail(),
            })
        }
    }

    fn master_has_content(&self) -> Result<bool> {
        let mut entries =
            fs::read_dir(&self.config.master_dir).map_err(RebuildError::MasterDir)?;
        Ok(entries.next().is_some())
    }

    fn tmp_path(&self, target: &Path) -> PathBuf {
        let mut path = OsString::from(target.as_os_str());
        path.push(&self.config.tmp_suffix);
        path.into()
    }
}

/// The format tools live in sbin directories that are not always on PATH.
fn resolve_binary(name: &str) -> String {
    for prefix in ["/usr/sbin", "/sbin", "/usr/bin", "/bin"] {
        let candidate = Path::new(prefix).join(name);
        if candidate.is_file() {
            return candidate.display().to_string();
        }
    }
    name.to_owned()
}

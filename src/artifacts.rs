use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use url::Url;

use crate::config::ArtifactSettings;
use crate::topology::{ArchiveCoordinates, ArtifactRef};

const CLASSPATH_SCHEME: &str = "classpath";

pub trait ArchiveRepository: Send + Sync {
    /// Root directory of an indexed archive, if the repository holds it.
    fn resolve_archive(&self, name: &str, version: &str) -> Option<PathBuf>;
}

pub trait ResourceLoader: Send + Sync {
    fn load(&self, reference: &str) -> Result<String>;
}

/// Archives stored as `<root>/<name>/<version>/`.
#[derive(Debug, Clone)]
pub struct FileArchiveRepository {
    root: PathBuf,
}

impl FileArchiveRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArchiveRepository for FileArchiveRepository {
    fn resolve_archive(&self, name: &str, version: &str) -> Option<PathBuf> {
        let dir = self.root.join(name).join(version);
        dir.is_dir().then_some(dir)
    }
}

/// Loads local paths, `file:`, `classpath:` (against search paths) and
/// `http(s):` references.
#[derive(Debug, Clone, Default)]
pub struct DefaultResourceLoader {
    search_paths: Vec<PathBuf>,
    allow_remote: bool,
}

impl DefaultResourceLoader {
    pub fn new(search_paths: Vec<PathBuf>, allow_remote: bool) -> Self {
        Self {
            search_paths,
            allow_remote,
        }
    }

    fn search(&self, relative: &str) -> Result<String> {
        for base in &self.search_paths {
            let candidate = base.join(relative);
            if candidate.is_file() {
                return read_text(&candidate);
            }
        }
        bail!("{relative} not found on search paths")
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("unable to read file: {}", path.display()))
}

/// Single-letter schemes are Windows drive letters, not URLs.
fn parse_url(reference: &str) -> Option<Url> {
    Url::parse(reference)
        .ok()
        .filter(|url| url.scheme().len() > 1)
}

impl ResourceLoader for DefaultResourceLoader {
    fn load(&self, reference: &str) -> Result<String> {
        match parse_url(reference) {
            Some(url) => match url.scheme() {
                CLASSPATH_SCHEME => self.search(strip_classpath(reference)),
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| anyhow!("invalid file url: {reference}"))?;
                    read_text(&path)
                }
                "http" | "https" => {
                    if !self.allow_remote {
                        bail!("remote artifact {reference} refused: remote loading disabled");
                    }
                    let response = ureq::get(reference)
                        .call()
                        .with_context(|| format!("unable to fetch {reference}"))?;
                    Ok(response.into_string()?)
                }
                other => bail!("unsupported artifact scheme: {other}"),
            },
            None => {
                let path = Path::new(reference);
                if path.is_absolute() {
                    return read_text(path);
                }
                self.search(reference).or_else(|_| {
                    if path.is_file() {
                        read_text(path)
                    } else {
                        bail!("{reference} not found")
                    }
                })
            }
        }
    }
}

fn strip_classpath(reference: &str) -> &str {
    reference
        .strip_prefix("classpath:")
        .unwrap_or(reference)
        .trim_start_matches('/')
}

/// Path inside an archive, when the reference points into one.
pub fn archive_relative(reference: &str) -> Option<&str> {
    match parse_url(reference) {
        Some(url) if url.scheme() == CLASSPATH_SCHEME => Some(strip_classpath(reference)),
        Some(_) => None,
        None => Some(reference),
    }
}

pub struct ArtifactResolver {
    archives: Box<dyn ArchiveRepository>,
    loader: Box<dyn ResourceLoader>,
    expanded_folder: String,
}

impl ArtifactResolver {
    pub fn new(
        archives: impl ArchiveRepository + 'static,
        loader: impl ResourceLoader + 'static,
        expanded_folder: impl Into<String>,
    ) -> Self {
        Self {
            archives: Box::new(archives),
            loader: Box::new(loader),
            expanded_folder: expanded_folder.into(),
        }
    }

    pub fn from_settings(settings: &ArtifactSettings) -> Self {
        Self::new(
            FileArchiveRepository::new(settings.repository.clone()),
            DefaultResourceLoader::new(settings.search_paths.clone(), settings.allow_remote),
            settings.expanded_folder.clone(),
        )
    }

    /// `<archive>/<expanded>/<relative>` when the archive is known.
    pub fn expanded_path(&self, archive: &ArchiveCoordinates, relative: &str) -> Option<PathBuf> {
        self.archives
            .resolve_archive(&archive.name, &archive.version)
            .map(|root| root.join(&self.expanded_folder).join(relative))
    }

    /// Script text for an implementation artifact. Archive-relative refs are
    /// read from the expanded archive first; everything else, and archive
    /// misses, go through the resource loader.
    pub fn load_script(
        &self,
        artifact: &ArtifactRef,
        fallback: Option<&ArchiveCoordinates>,
    ) -> Result<String> {
        let reference = artifact.reference.trim();
        if let Some(relative) = archive_relative(reference) {
            if let Some(coordinates) = artifact_archive(artifact).or_else(|| fallback.cloned()) {
                if let Some(path) = self.expanded_path(&coordinates, relative) {
                    if path.is_file() {
                        return read_text(&path);
                    }
                }
            }
        }
        self.loader.load(reference)
    }
}

pub fn artifact_archive(artifact: &ArtifactRef) -> Option<ArchiveCoordinates> {
    match (&artifact.archive_name, &artifact.archive_version) {
        (Some(name), Some(version)) if !name.is_empty() && !version.is_empty() => {
            Some(ArchiveCoordinates {
                name: name.clone(),
                version: version.clone(),
            })
        }
        _ => None,
    }
}

//! Packages and where their archives come from.
//!
//! A module is published by tagging a source-control project: tag `v1.2.0` makes version
//! `1.2.0` available.  A [`ModuleSource`] lists those versions and hands out the raw tar
//! archive of one of them, which [`open_module()`] feeds through the re-streaming pipeline.

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, ensure, Context, Result};
use log::debug;
use tokio::{fs::File, io::AsyncRead};

use crate::{
    pipeline::{self, PipelineStream},
    strip::StripDepth,
};

/// A package identifier: `namespace/name/provider`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Module {
    pub namespace: String,
    pub name: String,
    pub provider: String,
}

impl Module {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Result<Self> {
        let module = Self {
            namespace: namespace.into(),
            name: name.into(),
            provider: provider.into(),
        };
        for part in [&module.namespace, &module.name, &module.provider] {
            ensure!(
                !part.is_empty() && part != "." && part != ".." && !part.contains('/'),
                "invalid module component {part:?}"
            );
        }
        Ok(module)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.provider)
    }
}

impl FromStr for Module {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(name), Some(provider), None) => {
                Module::new(namespace, name, provider)
            }
            _ => bail!("module {s:?} is not of the form namespace/name/provider"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Namespace,
    Name,
    Provider,
}

/// Maps a module to the identifier of the project holding its sources.
///
/// `{namespace}`, `{name}` and `{provider}` are replaced by the module's fields; everything
/// else is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectTemplate {
    parts: Vec<Part>,
}

impl ProjectTemplate {
    pub fn render(&self, module: &Module) -> String {
        let mut project = String::new();
        for part in &self.parts {
            project.push_str(match part {
                Part::Literal(text) => text,
                Part::Namespace => &module.namespace,
                Part::Name => &module.name,
                Part::Provider => &module.provider,
            });
        }
        project
    }
}

impl Default for ProjectTemplate {
    fn default() -> Self {
        Self {
            parts: vec![Part::Namespace, Part::Literal("/".into()), Part::Name],
        }
    }
}

impl FromStr for ProjectTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = vec![];
        let mut rest = s;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let Some(close) = rest[open..].find('}') else {
                bail!("unterminated placeholder in project template {s:?}");
            };
            parts.push(match &rest[open + 1..open + close] {
                "namespace" => Part::Namespace,
                "name" => Part::Name,
                "provider" => Part::Provider,
                other => bail!("unknown placeholder {{{other}}} in project template {s:?}"),
            });
            rest = &rest[open + close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        ensure!(!parts.is_empty(), "empty project template");
        Ok(Self { parts })
    }
}

/// Turns a project's tags into the versions published by them.
///
/// Only tags starting with `v` count; the prefix is dropped.
pub fn versions_from_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|tag| tag.as_ref().strip_prefix('v').map(str::to_string))
        .filter(|version| !version.is_empty())
        .collect()
}

/// The tag a version is published under.
pub fn tag_for_version(version: &str) -> String {
    format!("v{version}")
}

/// Something that knows a module's versions and can fetch their archives.
pub trait ModuleSource {
    /// The raw tar stream of one version.
    type Archive: AsyncRead + Unpin + Send + 'static;

    fn versions(&self, module: &Module) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn archive(
        &self,
        module: &Module,
        version: &str,
    ) -> impl Future<Output = Result<Self::Archive>> + Send;
}

/// A [`ModuleSource`] backed by a directory tree: each project is a directory under `root`,
/// containing one `<tag>.tar` file per tag.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    template: ProjectTemplate,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, template: ProjectTemplate) -> Self {
        Self {
            root: root.into(),
            template,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding `module`'s tags.
    pub fn project_dir(&self, module: &Module) -> PathBuf {
        self.root.join(self.template.render(module))
    }
}

impl ModuleSource for DirectorySource {
    type Archive = File;

    async fn versions(&self, module: &Module) -> Result<Vec<String>> {
        let dir = self.project_dir(module);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Listing tags of {module} in {dir:?}"))?;

        let mut tags = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(tag) = file_name.to_str().and_then(|n| n.strip_suffix(".tar")) {
                tags.push(tag.to_string());
            }
        }
        tags.sort();
        debug!("{module}: {} tags in {dir:?}", tags.len());

        Ok(versions_from_tags(tags))
    }

    async fn archive(&self, module: &Module, version: &str) -> Result<File> {
        ensure!(
            !version.is_empty() && !version.contains('/'),
            "invalid version {version:?}"
        );
        let path = self
            .project_dir(module)
            .join(format!("{}.tar", tag_for_version(version)));
        debug!("{module} {version}: opening {path:?}");
        File::open(&path)
            .await
            .with_context(|| format!("Opening archive of {module} version {version}"))
    }
}

/// Fetches the archive of `module` at `version` and starts re-streaming it as a flat,
/// gzip-compressed tar with `depth` leading path segments removed.
pub async fn open_module<S: ModuleSource>(
    source: &S,
    module: &Module,
    version: &str,
    depth: StripDepth,
) -> Result<PipelineStream<S::Archive>> {
    let archive = source.archive(module, version).await?;
    Ok(pipeline::build(archive, depth))
}

//! Pipeline spec model & validation.
//!
//! A pipeline spec is fetched from a watched repository at a specific commit,
//! parsed into a [`SpecDocument`], and validated into an ordered, defaulted
//! [`PipelineSpec`]. Validation is pure and deterministic: converting a
//! validated spec back into a document and re-validating it yields an
//! identical spec, with defaults applied exactly once.

use serde::{Deserialize, Serialize};

/// Stage type driving a docker image build.
pub const STAGE_TYPE_BUILD: &str = "docker-build";
/// Stage type pushing a previously built image.
pub const STAGE_TYPE_PUSH: &str = "docker-push";
/// Stage type running arbitrary commands in a given image.
pub const STAGE_TYPE_CUSTOM: &str = "custom";

/// Default build directory for build stages.
pub const DEFAULT_BUILD_DIR: &str = ".";
/// Default dockerfile path for build stages.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Errors from parsing or validating a pipeline spec.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SpecError {
    /// The raw content is not a mapping containing a `stages` key.
    #[error("pipeline spec must be a mapping containing a `stages` key: {0}")]
    Schema(String),
    /// The spec declares no stages at all.
    #[error("pipeline must contain at least one stage")]
    NoStages,
    /// A stage is missing its `name` field.
    #[error("all stages require a `name` field")]
    UnnamedStage,
    /// A stage declares an unknown `type`.
    #[error("stage {stage}: type `{kind}` is not valid")]
    InvalidType { stage: String, kind: String },
    /// A stage name appears more than once in the spec.
    #[error("stage {stage}: stage names must be unique within a pipeline")]
    DuplicateName { stage: String },
    /// A stage is missing one or more required fields.
    #[error("stage {stage}: missing field(s) {fields}")]
    MissingFields { stage: String, fields: String },
    /// A push stage references a build stage not declared before it.
    #[error("stage {stage}: no previous build stage named `{from_stage}`")]
    UnknownFromStage { stage: String, from_stage: String },
    /// A push stage's `repo` carries a tag delimiter.
    #[error("stage {stage}: `repo` field may not contain tags")]
    RepoContainsTag { stage: String },
    /// A push stage's `tags` list is empty.
    #[error("stage {stage}: `tags` must be a non-empty list")]
    EmptyTags { stage: String },
    /// A custom stage's `commands` is not a non-empty list of strings.
    #[error("stage {stage}: `commands` must be a non-empty list of commands")]
    InvalidCommands { stage: String },
}

/// The raw, unvalidated pipeline spec document as found in a repository.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SpecDocument {
    pub stages: Vec<RawStage>,
}

/// One unvalidated stage entry of a spec document.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RawStage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    // docker-build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    // docker-push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    // custom
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<serde_yaml::Value>,
}

impl SpecDocument {
    /// Parse raw repository content into an unvalidated spec document.
    pub fn parse(content: &[u8]) -> Result<Self, SpecError> {
        serde_yaml::from_slice(content).map_err(|err| SpecError::Schema(err.to_string()))
    }

    /// Validate this document into an ordered, defaulted pipeline spec.
    ///
    /// Stages are checked in declared order, maintaining the running set of
    /// build-stage names seen so far; a push stage may only reference a build
    /// stage which appears strictly before it.
    pub fn validate(&self) -> Result<PipelineSpec, SpecError> {
        if self.stages.is_empty() {
            return Err(SpecError::NoStages);
        }

        let mut stages = Vec::with_capacity(self.stages.len());
        let mut seen_names: Vec<&str> = Vec::with_capacity(self.stages.len());
        let mut build_stages: Vec<&str> = Vec::new();

        for raw in &self.stages {
            let name = raw.name.as_deref().ok_or(SpecError::UnnamedStage)?;
            let kind = raw.kind.as_deref().ok_or_else(|| SpecError::MissingFields {
                stage: name.to_string(),
                fields: "type".to_string(),
            })?;
            if seen_names.contains(&name) {
                return Err(SpecError::DuplicateName { stage: name.to_string() });
            }
            seen_names.push(name);

            let stage = match kind {
                STAGE_TYPE_BUILD => {
                    build_stages.push(name);
                    Stage::Build {
                        name: name.to_string(),
                        build_dir: raw.build_dir.clone().unwrap_or_else(|| DEFAULT_BUILD_DIR.to_string()),
                        dockerfile: raw.dockerfile.clone().unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string()),
                    }
                }
                STAGE_TYPE_PUSH => {
                    let missing = missing_fields(&[
                        ("from_stage", raw.from_stage.is_some()),
                        ("repo", raw.repo.is_some()),
                        ("tags", raw.tags.is_some()),
                    ]);
                    if !missing.is_empty() {
                        return Err(SpecError::MissingFields {
                            stage: name.to_string(),
                            fields: missing,
                        });
                    }
                    let (from_stage, repo, tags) = (
                        raw.from_stage.clone().unwrap_or_default(),
                        raw.repo.clone().unwrap_or_default(),
                        raw.tags.clone().unwrap_or_default(),
                    );
                    if !build_stages.contains(&from_stage.as_str()) {
                        return Err(SpecError::UnknownFromStage {
                            stage: name.to_string(),
                            from_stage,
                        });
                    }
                    if repo.contains(':') {
                        return Err(SpecError::RepoContainsTag { stage: name.to_string() });
                    }
                    if tags.is_empty() {
                        return Err(SpecError::EmptyTags { stage: name.to_string() });
                    }
                    Stage::Push {
                        name: name.to_string(),
                        from_stage,
                        repo,
                        tags,
                    }
                }
                STAGE_TYPE_CUSTOM => {
                    let missing = missing_fields(&[("image", raw.image.is_some()), ("commands", raw.commands.is_some())]);
                    if !missing.is_empty() {
                        return Err(SpecError::MissingFields {
                            stage: name.to_string(),
                            fields: missing,
                        });
                    }
                    let commands = commands_list(raw.commands.as_ref()).ok_or_else(|| SpecError::InvalidCommands { stage: name.to_string() })?;
                    Stage::Custom {
                        name: name.to_string(),
                        image: raw.image.clone().unwrap_or_default(),
                        commands,
                    }
                }
                other => {
                    return Err(SpecError::InvalidType {
                        stage: name.to_string(),
                        kind: other.to_string(),
                    })
                }
            };
            stages.push(stage);
        }

        Ok(PipelineSpec { stages })
    }
}

/// Collect the names of absent required fields as a space separated string.
fn missing_fields(fields: &[(&str, bool)]) -> String {
    fields
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract a non-empty list of command strings, if the value has that shape.
fn commands_list(val: Option<&serde_yaml::Value>) -> Option<Vec<String>> {
    let seq = val?.as_sequence()?;
    if seq.is_empty() {
        return None;
    }
    seq.iter().map(|item| item.as_str().map(String::from)).collect()
}

/// A validated, ordered, defaulted pipeline spec.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PipelineSpec {
    pub stages: Vec<Stage>,
}

/// One validated unit of work within a pipeline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Stage {
    #[serde(rename = "docker-build")]
    Build { name: String, build_dir: String, dockerfile: String },
    #[serde(rename = "docker-push")]
    Push {
        name: String,
        from_stage: String,
        repo: String,
        tags: Vec<String>,
    },
    #[serde(rename = "custom")]
    Custom { name: String, image: String, commands: Vec<String> },
}

impl Stage {
    /// The stage's name.
    pub fn name(&self) -> &str {
        match self {
            Stage::Build { name, .. } | Stage::Push { name, .. } | Stage::Custom { name, .. } => name,
        }
    }

    /// Destination image references of a push stage, one per tag.
    pub fn destinations(&self) -> Vec<String> {
        match self {
            Stage::Push { repo, tags, .. } => tags.iter().map(|tag| format!("{}:{}", repo, tag)).collect(),
            _ => Vec::new(),
        }
    }
}

impl PipelineSpec {
    /// The declared, validated order of stage names.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Convert back into an unvalidated document.
    ///
    /// Useful for round-tripping: `doc.validate()?.to_document().validate()`
    /// returns the same spec.
    pub fn to_document(&self) -> SpecDocument {
        let stages = self
            .stages
            .iter()
            .map(|stage| match stage {
                Stage::Build { name, build_dir, dockerfile } => RawStage {
                    name: Some(name.clone()),
                    kind: Some(STAGE_TYPE_BUILD.to_string()),
                    build_dir: Some(build_dir.clone()),
                    dockerfile: Some(dockerfile.clone()),
                    ..Default::default()
                },
                Stage::Push { name, from_stage, repo, tags } => RawStage {
                    name: Some(name.clone()),
                    kind: Some(STAGE_TYPE_PUSH.to_string()),
                    from_stage: Some(from_stage.clone()),
                    repo: Some(repo.clone()),
                    tags: Some(tags.clone()),
                    ..Default::default()
                },
                Stage::Custom { name, image, commands } => RawStage {
                    name: Some(name.clone()),
                    kind: Some(STAGE_TYPE_CUSTOM.to_string()),
                    image: Some(image.clone()),
                    commands: Some(serde_yaml::Value::Sequence(
                        commands.iter().map(|cmd| serde_yaml::Value::String(cmd.clone())).collect(),
                    )),
                    ..Default::default()
                },
            })
            .collect();
        SpecDocument { stages }
    }
}

//! In-memory component descriptor (devfile) model.
//!
//! The YAML parsing and schema validation of devfiles happen outside this
//! crate; the adapter consumes the already-validated structures defined here.
//! What this module does own is cross-reference validation: commands must
//! target declared container units, volume mounts must reference declared
//! volumes, and each command group may carry at most one default.

mod commands;

pub use commands::{
    CommandError, PushCommands, resolve_group_command, resolve_push_commands, resolve_test_command,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Classification of a devfile command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CommandGroupKind {
    /// One-time project initialization, run only on the first push.
    Init,
    /// Project build, run on every push that reaches the exec stage.
    Build,
    /// The long-running application process. Mandatory.
    #[default]
    Run,
    /// Test execution, run only on explicit request.
    Test,
    /// Debug variant of the run command.
    Debug,
}

impl fmt::Display for CommandGroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandGroupKind::Init => "init",
            CommandGroupKind::Build => "build",
            CommandGroupKind::Run => "run",
            CommandGroupKind::Test => "test",
            CommandGroupKind::Debug => "debug",
        };
        write!(f, "{}", name)
    }
}

/// A declared environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name, unique within a unit.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A declared network endpoint of a container unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint name.
    pub name: String,
    /// Port the containerized process listens on.
    pub target_port: u16,
    /// Whether the endpoint is exposed to the developer's host.
    pub exposed: bool,
}

/// A volume mount declared by a container unit, referencing a declared volume
/// by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Declared volume name.
    pub name: String,
    /// Mount path inside the container.
    pub path: String,
}

/// A declared volume, shared by name across the units that mount it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevfileVolume {
    /// Volume name.
    pub name: String,
    /// Requested size (platform-interpreted, e.g. `1Gi`).
    pub size: Option<String>,
}

/// One declared workload unit of the component.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerUnit {
    /// Unit alias, unique within the devfile.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint override; empty means the image default (or the supervisor,
    /// when this unit hosts the run command).
    pub command: Vec<String>,
    /// Entrypoint arguments.
    pub args: Vec<String>,
    /// Declared environment.
    pub env: Vec<EnvVar>,
    /// Declared endpoints.
    pub endpoints: Vec<Endpoint>,
    /// Declared volume mounts.
    pub volume_mounts: Vec<VolumeMount>,
    /// Whether the shared source volume is mounted into this unit.
    pub mount_sources: bool,
    /// Override for the source mount path.
    pub source_mapping: Option<String>,
}

/// One declared command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevfileCommand {
    /// Command id, unique in the devfile; compared case-insensitively.
    pub id: String,
    /// Shell command line executed via `sh -c`.
    pub command_line: String,
    /// Working directory for the command.
    pub working_dir: Option<String>,
    /// Alias of the container unit the command runs in.
    pub component: String,
    /// Group classification.
    pub group: CommandGroupKind,
    /// Whether this command is its group's default.
    pub is_default: bool,
    /// A hot-reload-capable run command is re-signaled in place instead of
    /// being restarted when the component already exists.
    pub hot_reload_capable: bool,
}

/// The validated component descriptor consumed by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Devfile {
    /// Devfile schema version, e.g. `"2.0.0"`.
    pub schema_version: String,
    /// Declared container units, in declaration order.
    pub components: Vec<ContainerUnit>,
    /// Declared commands.
    pub commands: Vec<DevfileCommand>,
    /// Declared volumes.
    pub volumes: Vec<DevfileVolume>,
}

/// Cross-reference validation failures.
#[derive(Debug, thiserror::Error)]
pub enum DevfileError {
    /// The devfile declares no container units at all.
    #[error("no container components found in the devfile")]
    NoComponents,

    /// Two commands share an id.
    #[error("duplicate command id {id}")]
    DuplicateCommandId {
        /// The duplicated id.
        id: String,
    },

    /// A command targets an alias no unit declares.
    #[error("command {id} references unknown container component {alias}")]
    UnknownComponentAlias {
        /// Command id.
        id: String,
        /// The missing alias.
        alias: String,
    },

    /// A unit mounts a volume the devfile does not declare.
    #[error("container {alias} mounts undeclared volume {name}")]
    UnknownVolume {
        /// Unit alias.
        alias: String,
        /// The missing volume name.
        name: String,
    },

    /// A group declares more than one default command.
    #[error("more than one default command in the {group} group")]
    MultipleDefaults {
        /// The offending group.
        group: CommandGroupKind,
    },
}

impl Devfile {
    /// Validate cross-references between commands, units and volumes.
    ///
    /// Schema shape is the parser's responsibility; this catches dangling
    /// references a structurally valid devfile can still contain.
    pub fn validate(&self) -> Result<(), DevfileError> {
        if self.components.is_empty() {
            return Err(DevfileError::NoComponents);
        }

        let aliases: BTreeSet<&str> = self.components.iter().map(|c| c.name.as_str()).collect();
        let volumes: BTreeSet<&str> = self.volumes.iter().map(|v| v.name.as_str()).collect();

        let mut seen_ids = BTreeSet::new();
        for command in &self.commands {
            let id = command.id.to_lowercase();
            if !seen_ids.insert(id) {
                return Err(DevfileError::DuplicateCommandId {
                    id: command.id.clone(),
                });
            }
            if !aliases.contains(command.component.as_str()) {
                return Err(DevfileError::UnknownComponentAlias {
                    id: command.id.clone(),
                    alias: command.component.clone(),
                });
            }
        }

        for unit in &self.components {
            for mount in &unit.volume_mounts {
                if !volumes.contains(mount.name.as_str()) {
                    return Err(DevfileError::UnknownVolume {
                        alias: unit.name.clone(),
                        name: mount.name.clone(),
                    });
                }
            }
        }

        for group in [
            CommandGroupKind::Init,
            CommandGroupKind::Build,
            CommandGroupKind::Run,
            CommandGroupKind::Test,
            CommandGroupKind::Debug,
        ] {
            let defaults = self
                .commands
                .iter()
                .filter(|c| c.group == group && c.is_default)
                .count();
            if defaults > 1 {
                return Err(DevfileError::MultipleDefaults { group });
            }
        }

        Ok(())
    }

    /// Commands belonging to one group, in declaration order.
    pub fn group_commands(&self, group: CommandGroupKind) -> Vec<&DevfileCommand> {
        self.commands.iter().filter(|c| c.group == group).collect()
    }

    /// Look up a command by id, case-insensitively.
    pub fn command_by_id(&self, id: &str) -> Option<&DevfileCommand> {
        self.commands.iter().find(|c| c.id.eq_ignore_ascii_case(id))
    }

    /// Look up a container unit by alias.
    pub fn unit(&self, alias: &str) -> Option<&ContainerUnit> {
        self.components.iter().find(|c| c.name == alias)
    }

    /// Whether the schema version carries test command groups (2.0.0+).
    pub fn supports_test_groups(&self) -> bool {
        self.schema_version
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok())
            .is_some_and(|major| major >= 2)
    }
}

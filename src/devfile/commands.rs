//! Command group resolution.
//!
//! Each push resolves up to three command slots (init, build, run) before any
//! container is touched, so a devfile that cannot produce a valid command set
//! fails pre-flight. Resolution precedence per slot: an explicit override
//! name wins if it exists and belongs to the requested group; otherwise the
//! group's single default command is used; init and build are optional, run
//! is mandatory.

use super::{CommandGroupKind, Devfile, DevfileCommand};

/// Command resolution failures (all pre-flight, none retried).
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The devfile declares no run-group command at all.
    #[error("the devfile has no command of group run; a run command is required to push")]
    NoRunCommand,

    /// A group has commands but none marked default and no override was given.
    #[error("the {group} group has no default command; mark one with isDefault")]
    NoDefaultCommand {
        /// The offending group.
        group: CommandGroupKind,
    },

    /// A group carries more than one default command.
    #[error("more than one default command found in the {group} group")]
    AmbiguousDefaultCommand {
        /// The offending group.
        group: CommandGroupKind,
    },

    /// An override names a command the devfile does not declare.
    #[error("command {name} not found in the devfile")]
    NotFound {
        /// The missing command name.
        name: String,
    },

    /// An override names a command from a different group.
    #[error("command {name} belongs to the {actual} group, not {expected}")]
    GroupMismatch {
        /// The named command.
        name: String,
        /// Group the caller asked for.
        expected: CommandGroupKind,
        /// Group the command actually belongs to.
        actual: CommandGroupKind,
    },
}

/// The command slots a push executes, resolved and validated up front.
#[derive(Debug, Clone)]
pub struct PushCommands {
    /// Init command, run only when the component did not previously exist.
    pub init: Option<DevfileCommand>,
    /// Build command, run on every exec cycle when present.
    pub build: Option<DevfileCommand>,
    /// Run (or debug, when pushing in debug mode) command. Mandatory.
    pub run: DevfileCommand,
}

/// Resolve one group slot.
///
/// With an override name, the command must exist and belong to `group`.
/// Without one, the group's single default wins; several defaults are
/// ambiguous; commands-but-no-default is an error distinct from an absent
/// group, which resolves to `None`.
pub fn resolve_group_command(
    devfile: &Devfile,
    group: CommandGroupKind,
    override_name: Option<&str>,
) -> Result<Option<DevfileCommand>, CommandError> {
    if let Some(name) = override_name.filter(|n| !n.is_empty()) {
        let command = devfile
            .command_by_id(name)
            .ok_or_else(|| CommandError::NotFound {
                name: name.to_string(),
            })?;
        if command.group != group {
            return Err(CommandError::GroupMismatch {
                name: name.to_string(),
                expected: group,
                actual: command.group,
            });
        }
        return Ok(Some(command.clone()));
    }

    let candidates = devfile.group_commands(group);
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut defaults = candidates.iter().filter(|c| c.is_default);
    match (defaults.next(), defaults.next()) {
        (Some(command), None) => Ok(Some((*command).clone())),
        (Some(_), Some(_)) => Err(CommandError::AmbiguousDefaultCommand { group }),
        (None, _) => Err(CommandError::NoDefaultCommand { group }),
    }
}

/// Resolve the full push command set.
///
/// When `debug` is set the run slot resolves from the debug group instead;
/// either way the slot is mandatory.
pub fn resolve_push_commands(
    devfile: &Devfile,
    init_override: Option<&str>,
    build_override: Option<&str>,
    run_override: Option<&str>,
    debug_override: Option<&str>,
    debug: bool,
) -> Result<PushCommands, CommandError> {
    let init = resolve_group_command(devfile, CommandGroupKind::Init, init_override)?;
    let build = resolve_group_command(devfile, CommandGroupKind::Build, build_override)?;

    let (run_group, run_override) = if debug {
        (CommandGroupKind::Debug, debug_override)
    } else {
        (CommandGroupKind::Run, run_override)
    };
    let run = resolve_group_command(devfile, run_group, run_override)?
        .ok_or(CommandError::NoRunCommand)?;

    Ok(PushCommands { init, build, run })
}

/// Resolve the test command for an explicit `test` invocation.
pub fn resolve_test_command(
    devfile: &Devfile,
    override_name: Option<&str>,
) -> Result<DevfileCommand, CommandError> {
    resolve_group_command(devfile, CommandGroupKind::Test, override_name)?.ok_or(
        CommandError::NoDefaultCommand {
            group: CommandGroupKind::Test,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfile::ContainerUnit;

    fn command(id: &str, group: CommandGroupKind, is_default: bool) -> DevfileCommand {
        DevfileCommand {
            id: id.to_string(),
            command_line: format!("echo {}", id),
            component: "runtime".to_string(),
            group,
            is_default,
            ..Default::default()
        }
    }

    fn devfile(commands: Vec<DevfileCommand>) -> Devfile {
        Devfile {
            schema_version: "2.0.0".to_string(),
            components: vec![ContainerUnit {
                name: "runtime".to_string(),
                image: "alpine".to_string(),
                ..Default::default()
            }],
            commands,
            volumes: vec![],
        }
    }

    #[test]
    fn test_single_default_wins() {
        let devfile = devfile(vec![
            command("run-a", CommandGroupKind::Run, false),
            command("run-b", CommandGroupKind::Run, true),
        ]);
        let resolved = resolve_group_command(&devfile, CommandGroupKind::Run, None)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, "run-b");
    }

    #[test]
    fn test_zero_defaults_is_an_error() {
        let devfile = devfile(vec![command("run-a", CommandGroupKind::Run, false)]);
        assert!(matches!(
            resolve_group_command(&devfile, CommandGroupKind::Run, None),
            Err(CommandError::NoDefaultCommand {
                group: CommandGroupKind::Run
            })
        ));
    }

    #[test]
    fn test_multiple_defaults_are_ambiguous() {
        let devfile = devfile(vec![
            command("run-a", CommandGroupKind::Run, true),
            command("run-b", CommandGroupKind::Run, true),
        ]);
        assert!(matches!(
            resolve_group_command(&devfile, CommandGroupKind::Run, None),
            Err(CommandError::AmbiguousDefaultCommand {
                group: CommandGroupKind::Run
            })
        ));
    }

    #[test]
    fn test_override_wins_over_default() {
        let devfile = devfile(vec![
            command("run-a", CommandGroupKind::Run, true),
            command("run-b", CommandGroupKind::Run, false),
        ]);
        let resolved = resolve_group_command(&devfile, CommandGroupKind::Run, Some("run-b"))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, "run-b");
    }

    #[test]
    fn test_override_must_exist() {
        let devfile = devfile(vec![command("run-a", CommandGroupKind::Run, true)]);
        assert!(matches!(
            resolve_group_command(&devfile, CommandGroupKind::Run, Some("missing")),
            Err(CommandError::NotFound { .. })
        ));
    }

    #[test]
    fn test_override_must_match_group() {
        let devfile = devfile(vec![
            command("run-a", CommandGroupKind::Run, true),
            command("build-a", CommandGroupKind::Build, true),
        ]);
        assert!(matches!(
            resolve_group_command(&devfile, CommandGroupKind::Run, Some("build-a")),
            Err(CommandError::GroupMismatch {
                expected: CommandGroupKind::Run,
                actual: CommandGroupKind::Build,
                ..
            })
        ));
    }

    #[test]
    fn test_absent_optional_group_resolves_to_none() {
        let devfile = devfile(vec![command("run-a", CommandGroupKind::Run, true)]);
        let init = resolve_group_command(&devfile, CommandGroupKind::Init, None).unwrap();
        assert!(init.is_none());
    }

    #[test]
    fn test_push_requires_a_run_command() {
        let devfile = devfile(vec![command("build-a", CommandGroupKind::Build, true)]);
        assert!(matches!(
            resolve_push_commands(&devfile, None, None, None, None, false),
            Err(CommandError::NoRunCommand)
        ));
    }

    #[test]
    fn test_debug_push_resolves_the_debug_group() {
        let devfile = devfile(vec![
            command("run-a", CommandGroupKind::Run, true),
            command("debug-a", CommandGroupKind::Debug, true),
        ]);
        let commands = resolve_push_commands(&devfile, None, None, None, None, true).unwrap();
        assert_eq!(commands.run.id, "debug-a");
    }

    #[test]
    fn test_full_resolution_with_optional_slots() {
        let devfile = devfile(vec![
            command("setup", CommandGroupKind::Init, true),
            command("compile", CommandGroupKind::Build, true),
            command("serve", CommandGroupKind::Run, true),
        ]);
        let commands = resolve_push_commands(&devfile, None, None, None, None, false).unwrap();
        assert_eq!(commands.init.as_ref().map(|c| c.id.as_str()), Some("setup"));
        assert_eq!(
            commands.build.as_ref().map(|c| c.id.as_str()),
            Some("compile")
        );
        assert_eq!(commands.run.id, "serve");
    }

    #[test]
    fn test_resolve_test_command() {
        let devfile = devfile(vec![
            command("run-a", CommandGroupKind::Run, true),
            command("unit-tests", CommandGroupKind::Test, true),
        ]);
        let resolved = resolve_test_command(&devfile, Some("unit-tests")).unwrap();
        assert_eq!(resolved.id, "unit-tests");
        let by_default = resolve_test_command(&devfile, None).unwrap();
        assert_eq!(by_default.id, "unit-tests");
    }
}

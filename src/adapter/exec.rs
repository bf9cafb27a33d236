//! Command execution engine.
//!
//! Sequences the resolved push command slots inside the component's live
//! containers: init only on first push, build on every exec cycle, and run
//! through the supervisor so the application process can be restarted (or
//! left alone, for hot-reload-capable commands) without destroying the
//! container. Failures abort the remaining sequence and carry the command id
//! and owning unit alias.

use crate::adapter::{AdapterError, Result};
use crate::devfile::{DevfileCommand, PushCommands};
use crate::events::{CommandEvent, EventSink};
use crate::runtime::{ContainerInfo, ExecSpec, OutputChunk, Runtime};
use crate::{env, labels};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Spawn a task printing live output chunks to the caller's terminal and
/// return the sending half. The task drains until every sender is dropped.
pub(crate) fn spawn_live_printer() -> mpsc::UnboundedSender<OutputChunk> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<OutputChunk>();
    tokio::spawn(async move {
        while let Some(chunk) = receiver.recv().await {
            match chunk {
                OutputChunk::Stdout(text) => print!("{}", text),
                OutputChunk::Stderr(text) => eprint!("{}", text),
            }
        }
    });
    sender
}

fn container_for_alias<'a>(
    containers: &'a [ContainerInfo],
    alias: &str,
) -> Result<&'a ContainerInfo> {
    containers
        .iter()
        .find(|c| c.label(labels::ALIAS) == Some(alias))
        .ok_or_else(|| AdapterError::MissingUnitContainer {
            alias: alias.to_string(),
        })
}

/// Execute one devfile command synchronously in its owning unit's container,
/// reporting lifecycle through the event sink.
pub(crate) async fn run_devfile_command(
    runtime: &dyn Runtime,
    events: &dyn EventSink,
    command: &DevfileCommand,
    containers: &[ContainerInfo],
    show: bool,
) -> Result<()> {
    let container = container_for_alias(containers, &command.component)?;
    let spec = ExecSpec {
        command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.command_line.clone(),
        ],
        working_dir: command.working_dir.clone(),
        ..Default::default()
    };
    execute_in(runtime, events, command, &container.id, &spec, show).await
}

/// Shared exec path: emits start/finish/error events and maps failures onto
/// command-scoped errors.
async fn execute_in(
    runtime: &dyn Runtime,
    events: &dyn EventSink,
    command: &DevfileCommand,
    container_id: &str,
    spec: &ExecSpec,
    show: bool,
) -> Result<()> {
    info!(command = %command.id, alias = %command.component, "executing command");
    events.emit(&CommandEvent::CommandStarted {
        command_id: command.id.clone(),
        component_alias: command.component.clone(),
        timestamp: Utc::now(),
    });

    let live = show.then(spawn_live_printer);
    let output = match runtime.exec(container_id, spec, live).await {
        Ok(output) => output,
        Err(e) => {
            events.emit(&CommandEvent::CommandErrored {
                command_id: command.id.clone(),
                component_alias: command.component.clone(),
                message: e.to_string(),
                timestamp: Utc::now(),
            });
            return Err(AdapterError::CommandTransport {
                id: command.id.clone(),
                alias: command.component.clone(),
                source: e,
            });
        }
    };

    events.emit(&CommandEvent::CommandFinished {
        command_id: command.id.clone(),
        component_alias: command.component.clone(),
        exit_code: output.exit_code,
        timestamp: Utc::now(),
    });

    if !output.success() {
        return Err(AdapterError::CommandFailed {
            id: command.id.clone(),
            alias: command.component.clone(),
            exit_code: output.exit_code,
        });
    }
    Ok(())
}

/// Run the resolved push slots in order with their guards.
pub(crate) async fn exec_push_commands(
    runtime: &dyn Runtime,
    events: &dyn EventSink,
    commands: &PushCommands,
    component_exists: bool,
    show: bool,
    containers: &[ContainerInfo],
) -> Result<()> {
    // Init runs exactly once, on the push that created the component.
    if !component_exists {
        if let Some(init) = &commands.init {
            run_devfile_command(runtime, events, init, containers, show).await?;
        }
    }

    // Build runs on every exec cycle; an absent build group is silent.
    if let Some(build) = &commands.build {
        run_devfile_command(runtime, events, build, containers, show).await?;
    } else {
        debug!("no build command declared, skipping build stage");
    }

    exec_run_command(runtime, events, &commands.run, component_exists, show, containers).await
}

/// Drive the run command through the supervisor.
async fn exec_run_command(
    runtime: &dyn Runtime,
    events: &dyn EventSink,
    run: &DevfileCommand,
    component_exists: bool,
    show: bool,
    containers: &[ContainerInfo],
) -> Result<()> {
    let container = container_for_alias(containers, &run.component)?;

    // A freshly created container whose entrypoint is not the supervisor
    // needs the daemon started before any program control works.
    if !component_exists {
        ensure_supervisor_daemon(runtime, run, container).await?;
    }

    if component_exists && run.hot_reload_capable {
        // Hot-reload-capable commands are only signaled when not already
        // running; the supervisor refuses a second start, which is the
        // idempotence we want, so a non-zero exit here is not a failure.
        debug!(command = %run.id, "hot reload capable; starting only if not running");
        let spec = supervisor_ctl(&["start", env::SUPERVISOR_RUN_PROGRAM]);
        events.emit(&CommandEvent::CommandStarted {
            command_id: run.id.clone(),
            component_alias: run.component.clone(),
            timestamp: Utc::now(),
        });
        let output = runtime
            .exec(&container.id, &spec, show.then(spawn_live_printer))
            .await
            .map_err(|e| AdapterError::CommandTransport {
                id: run.id.clone(),
                alias: run.component.clone(),
                source: e,
            })?;
        events.emit(&CommandEvent::CommandFinished {
            command_id: run.id.clone(),
            component_alias: run.component.clone(),
            exit_code: output.exit_code,
            timestamp: Utc::now(),
        });
        return Ok(());
    }

    // Full restart: stop whatever runs, then start the managed program.
    let stop = supervisor_ctl(&["stop", "all"]);
    let start = supervisor_ctl(&["start", env::SUPERVISOR_RUN_PROGRAM]);

    execute_in(runtime, events, run, &container.id, &stop, show).await?;
    execute_in(runtime, events, run, &container.id, &start, show).await
}

/// Start the supervisor daemon when the container's entrypoint is not already
/// the supervisor itself.
async fn ensure_supervisor_daemon(
    runtime: &dyn Runtime,
    run: &DevfileCommand,
    container: &ContainerInfo,
) -> Result<()> {
    let wrapped = container
        .entrypoint
        .first()
        .is_some_and(|cmd| cmd.contains(env::SUPERVISOR_BINARY));
    if wrapped {
        return Ok(());
    }

    debug!(alias = %run.component, "starting supervisor daemon");
    let spec = ExecSpec {
        command: vec![
            env::SUPERVISOR_BINARY.to_string(),
            "-c".to_string(),
            env::SUPERVISOR_CONF.to_string(),
            "-d".to_string(),
        ],
        ..Default::default()
    };
    runtime
        .exec(&container.id, &spec, None)
        .await
        .map_err(|e| AdapterError::CommandTransport {
            id: run.id.clone(),
            alias: run.component.clone(),
            source: e,
        })?;
    Ok(())
}

fn supervisor_ctl(args: &[&str]) -> ExecSpec {
    let mut command = vec![
        env::SUPERVISOR_BINARY.to_string(),
        "ctl".to_string(),
        "-c".to_string(),
        env::SUPERVISOR_CONF.to_string(),
    ];
    command.extend(args.iter().map(|a| a.to_string()));
    ExecSpec {
        command,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devfile::CommandGroupKind;
    use crate::events::NoOpEventSink;
    use crate::runtime::fake::{FakeRuntime, Op};
    use crate::runtime::{ContainerSpec, ContainerStore};

    fn command(id: &str, group: CommandGroupKind) -> DevfileCommand {
        DevfileCommand {
            id: id.to_string(),
            command_line: format!("echo {}", id),
            component: "runtime".to_string(),
            group,
            is_default: true,
            ..Default::default()
        }
    }

    async fn seeded_runtime() -> (FakeRuntime, Vec<ContainerInfo>) {
        let runtime = FakeRuntime::new();
        runtime
            .create_container(&ContainerSpec {
                image: "node:18".to_string(),
                labels: labels::unit_labels("web", "runtime"),
                ..Default::default()
            })
            .await
            .unwrap();
        let containers = runtime.containers();
        (runtime, containers)
    }

    fn exec_commands(runtime: &FakeRuntime) -> Vec<Vec<String>> {
        runtime
            .ops_where(|op| matches!(op, Op::Exec { .. }))
            .into_iter()
            .map(|op| match op {
                Op::Exec { command, .. } => command,
                _ => unreachable!(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_init_runs_only_for_new_components() {
        let (runtime, containers) = seeded_runtime().await;
        let commands = PushCommands {
            init: Some(command("setup", CommandGroupKind::Init)),
            build: None,
            run: command("serve", CommandGroupKind::Run),
        };

        exec_push_commands(&runtime, &NoOpEventSink, &commands, false, false, &containers)
            .await
            .unwrap();
        let with_init = exec_commands(&runtime);
        assert!(with_init.iter().any(|c| c.join(" ").contains("echo setup")));

        runtime.clear_ops();
        exec_push_commands(&runtime, &NoOpEventSink, &commands, true, false, &containers)
            .await
            .unwrap();
        let without_init = exec_commands(&runtime);
        assert!(!without_init.iter().any(|c| c.join(" ").contains("echo setup")));
    }

    #[tokio::test]
    async fn test_new_component_starts_supervisor_and_run_program() {
        let (runtime, containers) = seeded_runtime().await;
        let commands = PushCommands {
            init: None,
            build: Some(command("compile", CommandGroupKind::Build)),
            run: command("serve", CommandGroupKind::Run),
        };

        exec_push_commands(&runtime, &NoOpEventSink, &commands, false, false, &containers)
            .await
            .unwrap();

        let execs = exec_commands(&runtime);
        let joined: Vec<String> = execs.iter().map(|c| c.join(" ")).collect();
        assert!(joined.iter().any(|c| c.contains("echo compile")));
        assert!(joined.iter().any(|c| c.ends_with("-d")), "supervisor daemon start");
        assert!(joined.iter().any(|c| c.contains("ctl") && c.contains("stop all")));
        assert!(
            joined
                .iter()
                .any(|c| c.contains("ctl") && c.contains(&format!("start {}", env::SUPERVISOR_RUN_PROGRAM)))
        );
    }

    #[tokio::test]
    async fn test_hot_reload_run_skips_restart() {
        let (runtime, containers) = seeded_runtime().await;
        let mut run = command("serve", CommandGroupKind::Run);
        run.hot_reload_capable = true;
        let commands = PushCommands {
            init: None,
            build: None,
            run,
        };

        exec_push_commands(&runtime, &NoOpEventSink, &commands, true, false, &containers)
            .await
            .unwrap();

        let joined: Vec<String> = exec_commands(&runtime).iter().map(|c| c.join(" ")).collect();
        assert!(!joined.iter().any(|c| c.contains("stop all")));
        assert!(joined.iter().any(|c| c.contains(&format!("start {}", env::SUPERVISOR_RUN_PROGRAM))));
    }

    #[tokio::test]
    async fn test_failed_build_aborts_sequence() {
        let (runtime, containers) = seeded_runtime().await;
        runtime.set_exec_exit_code("echo compile", 2);
        let commands = PushCommands {
            init: None,
            build: Some(command("compile", CommandGroupKind::Build)),
            run: command("serve", CommandGroupKind::Run),
        };

        let result =
            exec_push_commands(&runtime, &NoOpEventSink, &commands, true, false, &containers)
                .await;
        match result {
            Err(AdapterError::CommandFailed { id, alias, exit_code }) => {
                assert_eq!(id, "compile");
                assert_eq!(alias, "runtime");
                assert_eq!(exit_code, 2);
            }
            other => panic!("expected CommandFailed, got {:?}", other.map(|_| ())),
        }

        // The run stage never executed.
        let joined: Vec<String> = exec_commands(&runtime).iter().map(|c| c.join(" ")).collect();
        assert!(!joined.iter().any(|c| c.contains("stop all")));
    }

    #[tokio::test]
    async fn test_events_report_lifecycle() {
        let (runtime, containers) = seeded_runtime().await;
        let (sink, mut receiver) = crate::events::ChannelEventSink::new();
        let build = command("compile", CommandGroupKind::Build);

        run_devfile_command(&runtime, &sink, &build, &containers, false)
            .await
            .unwrap();

        match receiver.try_recv().unwrap() {
            CommandEvent::CommandStarted { command_id, .. } => assert_eq!(command_id, "compile"),
            other => panic!("unexpected event {:?}", other),
        }
        match receiver.try_recv().unwrap() {
            CommandEvent::CommandFinished { exit_code, .. } => assert_eq!(exit_code, 0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_unit_container_is_an_error() {
        let runtime = FakeRuntime::new();
        let build = command("compile", CommandGroupKind::Build);
        let result = run_devfile_command(&runtime, &NoOpEventSink, &build, &[], false).await;
        assert!(matches!(
            result,
            Err(AdapterError::MissingUnitContainer { .. })
        ));
    }
}

//! Command dispatch for one inbound frame.
//!
//! Subscriptions and `transGet` run inline on the session's read loop.
//! Mutations are spawned so a slow write never stalls the reader; each one
//! still acknowledges exactly once.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tracing::Instrument;
use turbo_core::path;
use turbo_core::protocol::recover_ack;
use turbo_core::{Ack, ChangeEvent, Command, CommandKind, EventClass, TurboError};

use crate::hub::Hub;
use crate::session::Session;

/// What a handler produced besides success.
#[derive(Default)]
struct Outcome {
    result: Option<(Value, u64)>,
    /// A write whose events go out after the ack.
    announce: Option<(String, Value)>,
}

impl Outcome {
    fn with_result(value: Value, revision: u64) -> Self {
        Self {
            result: Some((value, revision)),
            announce: None,
        }
    }
}

/// Decode and run one frame from `session`.
pub async fn route(hub: &Arc<Hub>, session: &Arc<Session>, raw: &str) {
    let started = Instant::now();
    let cmd = match Command::decode(raw) {
        Ok(cmd) => cmd,
        Err(e) => {
            hub.metrics().command(None);
            reply(hub, session, recover_ack(raw), None, started, Err(e));
            return;
        }
    };
    let kind = match cmd.kind() {
        Ok(kind) => kind,
        Err(e) => {
            hub.metrics().command(None);
            tracing::debug!(session_id = %session.id(), cmd = %cmd.cmd, "unsupported command");
            reply(hub, session, cmd.ack, None, started, Err(e));
            return;
        }
    };
    hub.metrics().command(Some(kind));
    tracing::debug!(session_id = %session.id(), cmd = kind.as_str(), path = %cmd.path, "command");

    if kind.is_mutation() {
        let hub = Arc::clone(hub);
        let session = Arc::clone(session);
        let span = tracing::debug_span!("mutation", cmd = kind.as_str(), path = %cmd.path);
        tokio::spawn(
            async move {
                let result = execute(&hub, &session, kind, &cmd).await;
                reply(&hub, &session, cmd.ack, Some(kind), started, result);
            }
            .instrument(span),
        );
    } else {
        let result = execute(hub, session, kind, &cmd).await;
        reply(hub, session, cmd.ack, Some(kind), started, result);
    }
}

async fn execute(
    hub: &Hub,
    session: &Arc<Session>,
    kind: CommandKind,
    cmd: &Command,
) -> Result<Outcome, TurboError> {
    match kind {
        CommandKind::On => {
            if !hub.bus().subscribe(cmd.require_event_type()?, &cmd.path, session) {
                tracing::debug!(session_id = %session.id(), path = %cmd.path, "subscription refused, session closed");
            }
            Ok(Outcome::default())
        }
        CommandKind::Off => {
            hub.bus().unsubscribe(cmd.require_event_type()?, &cmd.path, session);
            Ok(Outcome::default())
        }
        CommandKind::Set => {
            let value = cmd.require_value()?.clone();
            set(hub, &cmd.path, value).await
        }
        CommandKind::Update => update(hub, &cmd.path, cmd.require_value()?).await,
        CommandKind::Remove => remove(hub, &cmd.path).await,
        CommandKind::TransGet => trans_get(hub, &cmd.path).await,
        CommandKind::TransSet => {
            let revision = cmd.require_revision()?;
            let value = cmd.require_value()?.clone();
            trans_set(hub, &cmd.path, revision, value).await
        }
        CommandKind::Push | CommandKind::Auth | CommandKind::Unauth => Ok(Outcome::default()),
    }
}

/// Send the ack, then any events deferred until after it.
fn reply(
    hub: &Hub,
    session: &Session,
    ack: Option<i64>,
    kind: Option<CommandKind>,
    started: Instant,
    result: Result<Outcome, TurboError>,
) {
    hub.metrics().command_latency(started.elapsed());
    match result {
        Ok(outcome) => {
            let frame = match outcome.result {
                Some((value, revision)) => Ack::with_result(ack, value, revision),
                None => Ack::ok(ack),
            };
            hub.send_ack(session, &frame);
            if let Some((path, value)) = outcome.announce {
                announce(hub, &path, value);
            }
        }
        Err(e) => {
            hub.metrics().command_error(e.error_kind());
            match &e {
                TurboError::Storage(_) => tracing::warn!(
                    session_id = %session.id(),
                    cmd = kind.map_or("unknown", |k| k.as_str()),
                    error = %e,
                    "command failed"
                ),
                _ => tracing::debug!(session_id = %session.id(), error = %e, "command rejected"),
            }
            hub.send_ack(session, &Ack::error(ack, &e));
        }
    }
}

/// Publish the events for a completed write at `path`: `value` to the path
/// itself, then `child_changed` (or `child_removed` for null) to its parent.
fn announce(hub: &Hub, path: &str, value: Value) {
    let parent_class = if value.is_null() {
        EventClass::ChildRemoved
    } else {
        EventClass::ChildChanged
    };
    hub.publish(EventClass::Value, &ChangeEvent::value(path, value.clone()));
    let parent = path::parent_of(path).filter(|p| hub.bus().has_subscribers(parent_class, p));
    if let Some(parent) = parent {
        hub.publish(parent_class, &ChangeEvent::child(parent_class, parent, path, value));
    }
}

async fn write(hub: &Hub, path: &str, value: Value) -> Result<u64, TurboError> {
    let revision = hub.store().set(path, value).await?;
    hub.bus().touch(path);
    Ok(revision)
}

async fn set(hub: &Hub, path: &str, value: Value) -> Result<Outcome, TurboError> {
    let revision = write(hub, path, value.clone()).await?;
    tracing::trace!(path, revision, "value written");
    Ok(Outcome {
        result: None,
        announce: Some((path.to_string(), value)),
    })
}

async fn update(hub: &Hub, base: &str, value: &Value) -> Result<Outcome, TurboError> {
    let Value::Object(entries) = value else {
        return Err(TurboError::protocol("'update' requires an object value"));
    };

    let writes = entries.iter().map(|(relative, value)| {
        let path = path::join(base, relative);
        let value = value.clone();
        async move {
            let written = {
                let _guard = hub.locker().lock(&path).await;
                write(hub, &path, value.clone()).await
            };
            match written {
                Ok(_) => {
                    announce(hub, &path, value);
                    Ok(())
                }
                Err(e) => Err(format!("{path}: {e}")),
            }
        }
    });

    let failures: Vec<String> = join_all(writes)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();
    if failures.is_empty() {
        Ok(Outcome::default())
    } else {
        Err(TurboError::Storage(failures.join("; ")))
    }
}

async fn remove(hub: &Hub, path: &str) -> Result<Outcome, TurboError> {
    let plan = hub
        .bus()
        .cascade_plan(path)
        .ok_or_else(|| TurboError::PathNotFound(path.to_string()))?;

    // Read every parent value before touching storage so a failed read
    // leaves both the data and the subscribers untouched.
    let mut parent_values = Vec::with_capacity(plan.len());
    for step in &plan {
        let value = match &step.parent {
            Some(parent) if hub.bus().has_subscribers(EventClass::ChildRemoved, parent) => {
                Some(hub.store().get(parent).await?.value)
            }
            _ => None,
        };
        parent_values.push(value);
    }

    hub.store().set(path, Value::Null).await?;

    for (step, parent_value) in plan.iter().zip(parent_values) {
        hub.publish(EventClass::Value, &ChangeEvent::value(&step.path, Value::Null));
        if let (Some(parent), Some(value)) = (&step.parent, parent_value) {
            hub.publish(
                EventClass::ChildRemoved,
                &ChangeEvent::child(EventClass::ChildRemoved, parent, &step.path, value),
            );
        }
    }
    for step in &plan {
        hub.bus().prune(&step.path);
    }
    Ok(Outcome::default())
}

async fn trans_get(hub: &Hub, path: &str) -> Result<Outcome, TurboError> {
    let entry = {
        let _guard = hub.locker().lock(path).await;
        hub.store().get(path).await?
    };
    Ok(Outcome::with_result(entry.value, entry.revision))
}

/// Compare under the path lock, then write like `set`. The lock is released
/// between the compare and the write.
async fn trans_set(hub: &Hub, path: &str, expected: u64, value: Value) -> Result<Outcome, TurboError> {
    {
        let _guard = hub.locker().lock(path).await;
        let current = hub.store().get(path).await?;
        if current.revision != expected {
            return Err(TurboError::Conflict {
                expected,
                current: current.revision,
                value: current.value,
            });
        }
    }
    set(hub, path, value).await
}

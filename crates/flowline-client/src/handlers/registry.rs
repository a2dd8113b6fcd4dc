use std::sync::Arc;

use flowline_proto::{EventKind, ServerEvent};
use tracing::Level;

use super::{invoke_guarded, EventHandler, HandlerKey, HandlerOverrides, HandlerProfile, HandlerTable};
use crate::error::ListenerError;
use crate::telemetry::{LogRecord, SharedSink};

/// Anything listeners can be attached to.
pub trait ListenerHost {
    fn off(&self, key: &HandlerKey) -> Result<usize, ListenerError>;
    fn on(&self, key: HandlerKey, handler: EventHandler) -> Result<(), ListenerError>;
    fn logger(&self) -> SharedSink;
}

#[derive(Debug, Default)]
pub struct Registration {
    pub registered: Vec<HandlerKey>,
    pub failed: Vec<(HandlerKey, ListenerError)>,
}

impl Registration {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Effective handler per key: a set override, else the profile's default.
/// Override keys outside the known taxonomy are carried over as-is.
pub fn resolve(profile: &HandlerProfile, overrides: &HandlerOverrides) -> HandlerTable {
    let mut table = HandlerTable::new();
    for kind in EventKind::ALL {
        let key = HandlerKey::Known(kind);
        let handler = overrides
            .get(&key)
            .cloned()
            .unwrap_or_else(|| profile.handler(kind));
        table.insert(key, handler);
    }
    for (key, handler) in overrides.iter() {
        if let (HandlerKey::Custom(_), Some(handler)) = (key, handler) {
            table.insert(key.clone(), handler.clone());
        }
    }
    table
}

/// Replace whatever is registered for each key of `table` on `host`.
///
/// Every handler is guarded so failures inside it are logged, not propagated.
/// A key the host refuses is logged and skipped.
pub fn register<H>(host: &H, table: HandlerTable) -> Registration
where
    H: ListenerHost + ?Sized,
{
    let sink = host.logger();
    let mut registration = Registration::default();

    for (key, handler) in table {
        let guarded = guard(handler, Arc::clone(&sink));
        let outcome = host.off(&key).and_then(|_| host.on(key.clone(), guarded));
        match outcome {
            Ok(()) => registration.registered.push(key),
            Err(err) => {
                sink.log(
                    LogRecord::new(
                        Level::WARN,
                        "registry",
                        format!("could not register handler for {key}: {err}"),
                    )
                    .with_event(key.as_str()),
                );
                registration.failed.push((key, err));
            }
        }
    }
    registration
}

fn guard(handler: EventHandler, sink: SharedSink) -> EventHandler {
    Arc::new(move |event: &ServerEvent| {
        invoke_guarded(&handler, event, sink.as_ref());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{handler, ProfileKind};
    use crate::telemetry::MemorySink;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeHost {
        listeners: Mutex<BTreeMap<HandlerKey, Vec<EventHandler>>>,
        refuse: Option<HandlerKey>,
        sink: Arc<MemorySink>,
    }

    impl ListenerHost for FakeHost {
        fn off(&self, key: &HandlerKey) -> Result<usize, ListenerError> {
            Ok(self
                .listeners
                .lock()
                .remove(key)
                .map(|removed| removed.len())
                .unwrap_or(0))
        }

        fn on(&self, key: HandlerKey, handler: EventHandler) -> Result<(), ListenerError> {
            if self.refuse.as_ref() == Some(&key) {
                return Err(ListenerError::Closed(Uuid::nil()));
            }
            self.listeners.lock().entry(key).or_default().push(handler);
            Ok(())
        }

        fn logger(&self) -> SharedSink {
            self.sink.clone()
        }
    }

    impl FakeHost {
        fn fire(&self, event: &ServerEvent) -> anyhow::Result<()> {
            let key = HandlerKey::from_name(event.name());
            let handlers = self.listeners.lock().get(&key).cloned().unwrap_or_default();
            for handler in handlers {
                handler(event)?;
            }
            Ok(())
        }

        fn count(&self, key: &HandlerKey) -> usize {
            self.listeners.lock().get(key).map_or(0, Vec::len)
        }
    }

    fn quiet_profile() -> HandlerProfile {
        HandlerProfile::new(ProfileKind::Quiet, MemorySink::new())
    }

    #[test]
    fn resolve_covers_every_kind() {
        let table = resolve(&quiet_profile(), &HandlerOverrides::new());
        for kind in EventKind::ALL {
            assert!(table.contains(&kind.into()), "missing {kind}");
        }
        assert_eq!(table.len(), EventKind::ALL.len());
    }

    #[test]
    fn overrides_replace_defaults_and_custom_keys_pass_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let overrides = HandlerOverrides::new()
            .on(EventKind::RunComplete, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on("progress_tick", |_| Ok(()))
            .unset(EventKind::RunStart);

        let table = resolve(&quiet_profile(), &overrides);
        assert!(table.contains(&HandlerKey::Custom("progress_tick".into())));
        assert!(table.contains(&EventKind::RunStart.into()));

        let event = ServerEvent::decode("run_complete", json!({"message": "ok"}));
        table.get(&EventKind::RunComplete.into()).unwrap()(&event).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registering_twice_does_not_duplicate_listeners() {
        let host = FakeHost::default();
        let table = resolve(&quiet_profile(), &HandlerOverrides::new());

        register(&host, table.clone());
        let registration = register(&host, table);

        assert!(registration.is_complete());
        assert_eq!(registration.registered.len(), EventKind::ALL.len());
        assert_eq!(host.count(&EventKind::RunError.into()), 1);
    }

    #[test]
    fn refused_keys_are_logged_and_skipped() {
        let host = FakeHost {
            refuse: Some(EventKind::NodeError.into()),
            ..FakeHost::default()
        };
        let registration = register(&host, resolve(&quiet_profile(), &HandlerOverrides::new()));

        assert_eq!(registration.failed.len(), 1);
        assert_eq!(registration.failed[0].0, HandlerKey::Known(EventKind::NodeError));
        assert_eq!(registration.registered.len(), EventKind::ALL.len() - 1);
        assert!(host.sink.contains(Level::WARN, "could not register handler for node_error"));
    }

    #[test]
    fn registered_handlers_never_propagate_failures() {
        let host = FakeHost::default();
        let overrides = HandlerOverrides::new()
            .on(EventKind::StreamOutput, |_| anyhow::bail!("bad chunk"))
            .with_handler(EventKind::NodeError, handler(|_| panic!("renderer exploded")));
        register(&host, resolve(&quiet_profile(), &overrides));

        host.fire(&ServerEvent::decode("stream_output", json!({}))).unwrap();
        host.fire(&ServerEvent::decode("node_error", json!({}))).unwrap();

        assert!(host.sink.contains(Level::ERROR, "bad chunk"));
        assert!(host.sink.contains(Level::ERROR, "renderer exploded"));
    }
}

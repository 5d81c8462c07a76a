//! Pre-publish warnings
//!
//! Independent features register warnings that may interject before a
//! publish. `show()` resolves them into one sequential confirmation chain:
//! one representative per group, highest priority first, each one able to
//! stop the publish.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::{Result, SyncError};

type DataFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type ShowFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type WarnFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct Warning {
    group: Option<String>,
    priority: i32,
    get_data: DataFn,
    should_show: ShowFn,
    warn_fn: WarnFn,
}

impl std::fmt::Debug for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warning")
            .field("group", &self.group)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Warning {
    /// `warn_fn` receives the data of every warning in its group and
    /// resolves to let the publish continue. Returning an error (usually
    /// `SyncError::WarningAborted`) stops it.
    pub fn new<F, Fut>(warn_fn: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            group: None,
            priority: 0,
            get_data: Arc::new(|| futures_util::future::ready(Ok(Value::Null)).boxed()),
            should_show: Arc::new(|_| true),
            warn_fn: Arc::new(move |data| warn_fn(data).boxed()),
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data<F, Fut>(mut self, get_data: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.get_data = Arc::new(move || get_data().boxed());
        self
    }

    pub fn show_if<F>(mut self, should_show: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.should_show = Arc::new(should_show);
        self
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

type Registry = Arc<Mutex<Vec<(u64, Warning)>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, Vec<(u64, Warning)>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Returned by `register`.
pub struct WarningRegistration {
    id: u64,
    registry: Registry,
}

impl WarningRegistration {
    pub fn unregister(self) {
        lock(&self.registry).retain(|(id, _)| *id != self.id);
    }
}

#[derive(Clone, Default)]
pub struct PublicationWarnings {
    registry: Registry,
    next_id: Arc<AtomicU64>,
}

impl PublicationWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, warning: Warning) -> WarningRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.registry).push((id, warning));
        WarningRegistration {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Registered warnings, in registration order.
    pub fn get_list(&self) -> Vec<Warning> {
        lock(&self.registry).iter().map(|(_, w)| w.clone()).collect()
    }

    /// Run the warning chain. Resolves when every surfaced warning let the
    /// publish continue; the first refusal is returned as the error.
    pub async fn show(&self) -> Result<()> {
        let mut groups: Vec<Vec<Warning>> = Vec::new();
        let mut group_names: Vec<Option<String>> = Vec::new();
        for warning in self.get_list() {
            let slot = warning
                .group
                .as_ref()
                .and_then(|name| group_names.iter().position(|g| g.as_ref() == Some(name)));
            match slot {
                Some(i) => groups[i].push(warning),
                None => {
                    group_names.push(warning.group.clone());
                    groups.push(vec![warning]);
                }
            }
        }

        let resolved = join_all(groups.into_iter().map(representative)).await;
        let mut chain = Vec::new();
        for group in resolved {
            if let Some(surfaced) = group? {
                chain.push(surfaced);
            }
        }
        chain.sort_by(|(a, _), (b, _)| b.priority.cmp(&a.priority));

        for (warning, data) in chain {
            if let Err(e) = (warning.warn_fn)(data).await {
                log::debug!("publish stopped by warning {:?}: {e}", warning.group);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// The group's highest-priority warning that wants to show, with the data
/// of every member. Ties go to the first registered.
async fn representative(members: Vec<Warning>) -> Result<Option<(Warning, Vec<Value>)>> {
    let data = join_all(members.iter().map(|w| (w.get_data)()))
        .await
        .into_iter()
        .collect::<Result<Vec<Value>>>()?;

    let mut best: Option<&Warning> = None;
    for (warning, value) in members.iter().zip(&data) {
        if !(warning.should_show)(value) {
            continue;
        }
        if best.map_or(true, |b| warning.priority > b.priority) {
            best = Some(warning);
        }
    }
    Ok(best.cloned().map(|warning| (warning, data)))
}

/// Convenience for warn functions that refuse.
pub fn declined(reason: impl Into<String>) -> SyncError {
    SyncError::WarningAborted(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording(log: &Log, name: &'static str, accept: bool) -> Warning {
        let log = Arc::clone(log);
        Warning::new(move |_| {
            log.lock().unwrap().push(name);
            async move {
                if accept {
                    Ok(())
                } else {
                    Err(declined(name))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_group_representatives_run_by_priority() {
        let log: Log = Arc::default();
        let warnings = PublicationWarnings::new();
        warnings.register(recording(&log, "A", true).in_group("g1").with_priority(5));
        warnings.register(recording(&log, "B", true).in_group("g1").with_priority(1));
        warnings.register(recording(&log, "C", true).with_priority(3));

        warnings.show().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_refusal_stops_the_chain() {
        let log: Log = Arc::default();
        let warnings = PublicationWarnings::new();
        warnings.register(recording(&log, "A", false).in_group("g1").with_priority(5));
        warnings.register(recording(&log, "B", true).in_group("g1").with_priority(1));
        warnings.register(recording(&log, "C", true).with_priority(3));

        assert_eq!(warnings.show().await, Err(SyncError::WarningAborted("A".into())));
        assert_eq!(*log.lock().unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_should_show_and_tie_break() {
        let log: Log = Arc::default();
        let warnings = PublicationWarnings::new();
        warnings.register(
            recording(&log, "hidden", true)
                .in_group("refs")
                .with_priority(9)
                .with_data(|| async { Ok::<_, SyncError>(json!({"count": 0})) })
                .show_if(|data| data["count"].as_u64().unwrap_or(0) > 0),
        );
        warnings.register(recording(&log, "first", true).in_group("refs").with_priority(2));
        warnings.register(recording(&log, "second", true).in_group("refs").with_priority(2));

        warnings.show().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_warn_fn_receives_group_data() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let warnings = PublicationWarnings::new();
        warnings.register(
            Warning::new(move |data| {
                *sink.lock().unwrap() = data;
                async { Ok::<_, SyncError>(()) }
            })
            .in_group("g")
            .with_data(|| async { Ok::<_, SyncError>(json!(1)) }),
        );
        warnings.register(
            Warning::new(|_| async { Ok::<_, SyncError>(()) })
                .in_group("g")
                .with_data(|| async { Ok::<_, SyncError>(json!(2)) })
                .show_if(|_| false),
        );

        warnings.show().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_nothing_to_show_resolves() {
        let warnings = PublicationWarnings::new();
        warnings.show().await.unwrap();

        let log: Log = Arc::default();
        warnings.register(recording(&log, "never", false).show_if(|_| false));
        warnings.show().await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_and_data_errors() {
        let log: Log = Arc::default();
        let warnings = PublicationWarnings::new();
        let registration = warnings.register(recording(&log, "A", false));
        assert_eq!(warnings.get_list().len(), 1);
        registration.unregister();
        assert!(warnings.get_list().is_empty());
        warnings.show().await.unwrap();

        warnings.register(
            Warning::new(|_| async { Ok::<_, SyncError>(()) })
                .with_data(|| async {
                    Err::<Value, _>(SyncError::Connection("refs lookup".into()))
                }),
        );
        assert!(matches!(warnings.show().await, Err(SyncError::Connection(_))));
    }
}

//! Replaying observable properties
//!
//! A `Property<T>` always has a current value. Subscribing yields that value
//! first, then every later change, and ends when the owner closes the
//! underlying channel. Derived properties are lazy: `map`, `filter` and
//! `skip_duplicates` wrap the source without spawning tasks.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

type Getter<T> = Arc<dyn Fn() -> T + Send + Sync>;
type Subscriber<T> = Arc<dyn Fn() -> BoxStream<'static, T> + Send + Sync>;

pub struct Property<T> {
    current: Getter<T>,
    subscribe: Subscriber<T>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            subscribe: Arc::clone(&self.subscribe),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Property<T> {
    /// Observe a watch channel.
    pub fn from_watch(rx: watch::Receiver<T>) -> Self {
        let getter_rx = rx.clone();
        Self {
            current: Arc::new(move || getter_rx.borrow().clone()),
            subscribe: Arc::new(move || watch_stream(rx.clone())),
        }
    }

    /// A property that never changes.
    pub fn constant(value: T) -> Self {
        let for_stream = value.clone();
        Self {
            current: Arc::new(move || value.clone()),
            subscribe: Arc::new(move || stream::iter(vec![for_stream.clone()]).boxed()),
        }
    }

    pub fn get(&self) -> T {
        (self.current)()
    }

    /// Current value first, then every change.
    pub fn subscribe(&self) -> BoxStream<'static, T> {
        (self.subscribe)()
    }

    pub fn map<U, F>(self, f: F) -> Property<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let current = Arc::clone(&self.current);
        let getter_f = Arc::clone(&f);
        let source = self.subscribe;
        Property {
            current: Arc::new(move || getter_f(&current())),
            subscribe: Arc::new(move || {
                let f = Arc::clone(&f);
                source().map(move |v| f(&v)).boxed()
            }),
        }
    }

    /// Suppress emissions rejected by `predicate`. `get()` is unaffected.
    pub fn filter<F>(self, predicate: F) -> Property<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let source = self.subscribe;
        Property {
            current: self.current,
            subscribe: Arc::new(move || {
                let predicate = Arc::clone(&predicate);
                source()
                    .filter(move |v| futures_util::future::ready(predicate(v)))
                    .boxed()
            }),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Property<T> {
    /// Drop emissions equal to the previous one.
    pub fn skip_duplicates(self) -> Property<T> {
        let source = self.subscribe;
        Property {
            current: self.current,
            subscribe: Arc::new(move || {
                let mut last: Option<T> = None;
                source()
                    .filter(move |v| {
                        let fresh = last.as_ref() != Some(v);
                        if fresh {
                            last = Some(v.clone());
                        }
                        futures_util::future::ready(fresh)
                    })
                    .boxed()
            }),
        }
    }
}

fn watch_stream<T: Clone + Send + Sync + 'static>(rx: watch::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next<T>(stream: &mut BoxStream<'static, T>) -> Option<T> {
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_replays_current_value() {
        let (tx, rx) = watch::channel(1);
        let prop = Property::from_watch(rx);
        tx.send(2).unwrap();

        let mut stream = prop.subscribe();
        assert_eq!(next(&mut stream).await, Some(2));
        tx.send(3).unwrap();
        assert_eq!(next(&mut stream).await, Some(3));
        assert_eq!(prop.get(), 3);
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, rx) = watch::channel("a");
        let mut stream = Property::from_watch(rx).subscribe();
        assert_eq!(next(&mut stream).await, Some("a"));
        drop(tx);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_map_and_skip_duplicates() {
        let (tx, rx) = watch::channel((1, "x"));
        let prop = Property::from_watch(rx).map(|(n, _)| *n).skip_duplicates();
        let mut stream = prop.subscribe();
        assert_eq!(next(&mut stream).await, Some(1));

        tx.send((1, "y")).unwrap();
        tx.send((1, "z")).unwrap();
        tokio::task::yield_now().await;
        tx.send((2, "z")).unwrap();
        assert_eq!(next(&mut stream).await, Some(2));
        assert_eq!(prop.get(), 2);
    }

    #[tokio::test]
    async fn test_filter_only_affects_stream() {
        let (tx, rx) = watch::channel(0);
        let prop = Property::from_watch(rx).filter(|v| v % 2 == 0);
        let mut stream = prop.subscribe();
        assert_eq!(next(&mut stream).await, Some(0));

        tx.send(1).unwrap();
        assert_eq!(next(&mut stream).await, None);
        assert_eq!(prop.get(), 1);

        tx.send(4).unwrap();
        assert_eq!(next(&mut stream).await, Some(4));
    }

    #[tokio::test]
    async fn test_constant() {
        let prop = Property::constant(7);
        let mut stream = prop.subscribe();
        assert_eq!(stream.next().await, Some(7));
        assert_eq!(stream.next().await, None);
    }
}

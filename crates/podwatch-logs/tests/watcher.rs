use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use podwatch_k8s::{LineStream, LogSource, OpenOptions, SourceError};
use podwatch_logs::{
    BackoffConfig, PodLogMessage, SearchOptions, WatchError, WatchStatus, WatcherConfig,
    WatcherService,
};

/// What the next `open` call for a pod returns
enum Session {
    /// Connection refused
    Fail,
    /// 404 from the API
    Gone,
    /// These lines, then the stream stays open
    Open(Vec<&'static str>),
    /// These lines, then the stream ends
    Closed(Vec<&'static str>),
    /// Lines fed by the test; ends when the sender is dropped
    Live(mpsc::UnboundedReceiver<String>),
}

/// In-memory log source following a per-pod script of sessions. Once a
/// script runs out, streams open but stay silent.
#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Session>>>,
    opens: Mutex<Vec<(String, OpenOptions, Instant)>>,
}

impl ScriptedSource {
    fn script(&self, pod: &str, sessions: Vec<Session>) {
        self.scripts
            .lock()
            .insert(pod.to_string(), sessions.into_iter().collect());
    }

    fn live(&self, pod: &str) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script(pod, vec![Session::Live(rx)]);
        tx
    }

    fn opens_for(&self, pod: &str) -> Vec<OpenOptions> {
        self.opens
            .lock()
            .iter()
            .filter(|(p, _, _)| p == pod)
            .map(|(_, o, _)| o.clone())
            .collect()
    }

    fn open_times_for(&self, pod: &str) -> Vec<Instant> {
        self.opens
            .lock()
            .iter()
            .filter(|(p, _, _)| p == pod)
            .map(|(_, _, at)| *at)
            .collect()
    }
}

fn lines(items: Vec<&'static str>) -> impl futures::Stream<Item = Result<String, SourceError>> {
    futures::stream::iter(items.into_iter().map(|l| Ok(l.to_string())))
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn open(&self, pod: &str, options: &OpenOptions) -> Result<LineStream, SourceError> {
        self.opens
            .lock()
            .push((pod.to_string(), options.clone(), Instant::now()));
        let next = self
            .scripts
            .lock()
            .get_mut(pod)
            .and_then(|sessions| sessions.pop_front());

        match next {
            Some(Session::Fail) => Err(SourceError::connection(pod, "connection refused")),
            Some(Session::Gone) => Err(SourceError::PodGone {
                pod: pod.to_string(),
            }),
            Some(Session::Open(items)) => Ok(lines(items).chain(futures::stream::pending()).boxed()),
            Some(Session::Closed(items)) => Ok(lines(items).boxed()),
            Some(Session::Live(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|line| (Ok::<_, SourceError>(line), rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending::<Result<String, SourceError>>().boxed()),
        }
    }
}

fn test_config() -> WatcherConfig {
    WatcherConfig {
        backoff: BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(20)),
        ..WatcherConfig::default()
    }
}

fn service_with(source: &Arc<ScriptedSource>) -> WatcherService {
    WatcherService::new(source.clone(), test_config())
}

/// Poll `cond` until it holds or two seconds pass
async fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn messages(service: &WatcherService, pod: &str) -> Vec<String> {
    service
        .snapshot(pod)
        .map(|msgs| msgs.into_iter().map(|m| m.message).collect())
        .unwrap_or_default()
}

async fn next_message(sub: &mut podwatch_logs::Subscription) -> PodLogMessage {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out waiting for a log event")
        .expect("feed ended unexpectedly")
}

#[tokio::test]
async fn search_finds_matching_line() {
    let source = Arc::new(ScriptedSource::default());
    source.script(
        "web-1",
        vec![Session::Open(vec!["start", "error: timeout", "retry ok"])],
    );
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1").len() == 3).await);

    let result = service
        .search("web-1", "error", &SearchOptions::default())
        .unwrap();
    assert_eq!(result.pod_name, "web-1");
    assert_eq!(result.matches, vec!["error: timeout"]);

    let empty = service.search("web-1", "", &SearchOptions::default()).unwrap();
    assert!(empty.matches.is_empty());
}

#[tokio::test]
async fn search_after_unwatch_is_not_found() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Open(vec!["hello"])]);
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1").len() == 1).await);
    service.unwatch("web-1").unwrap();

    let err = service
        .search("web-1", "hello", &SearchOptions::default())
        .unwrap_err();
    assert!(matches!(err, WatchError::NotFound(_)));
    assert!(matches!(service.unwatch("web-1"), Err(WatchError::NotFound(_))));
}

#[tokio::test]
async fn watching_twice_opens_one_stream() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Open(vec!["only once"])]);
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    service.watch("web-1").unwrap();
    assert_eq!(service.watch_many(["web-1", "web-1"]).unwrap(), 0);

    assert!(eventually(|| messages(&service, "web-1").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(source.opens_for("web-1").len(), 1);
    assert_eq!(service.watched().len(), 1);
    assert_eq!(messages(&service, "web-1"), vec!["only once"]);
}

#[tokio::test]
async fn retries_until_connected() {
    let source = Arc::new(ScriptedSource::default());
    source.script(
        "web-1",
        vec![Session::Fail, Session::Fail, Session::Open(vec!["finally"])],
    );
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1") == vec!["finally"]).await);
    assert!(eventually(|| service.status("web-1").ok() == Some(WatchStatus::Streaming)).await);
    assert_eq!(source.opens_for("web-1").len(), 3);
}

#[tokio::test]
async fn first_connect_requests_tail_history() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Open(vec!["x"])]);
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| !source.opens_for("web-1").is_empty()).await);

    let opens = source.opens_for("web-1");
    let first = &opens[0];
    assert_eq!(first.since_time, None);
    assert_eq!(first.tail_lines, Some(100));
}

#[tokio::test]
async fn reconnect_resumes_without_duplicates() {
    let source = Arc::new(ScriptedSource::default());
    source.script(
        "web-1",
        vec![
            Session::Closed(vec![
                "2024-01-15T10:00:01Z a",
                "2024-01-15T10:00:02Z b",
            ]),
            Session::Open(vec![
                "2024-01-15T10:00:01Z a",
                "2024-01-15T10:00:02Z b",
                "2024-01-15T10:00:03Z c",
            ]),
        ],
    );
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1").len() >= 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(messages(&service, "web-1"), vec!["a", "b", "c"]);

    let opens = source.opens_for("web-1");
    assert_eq!(opens.len(), 2);
    assert_eq!(
        opens[1].since_time.map(|t| t.to_rfc3339()),
        Some("2024-01-15T10:00:02+00:00".to_string())
    );
}

#[tokio::test]
async fn pod_removed_from_cluster_is_forgotten() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Gone]);
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| service.watched().is_empty()).await);
    assert!(matches!(
        service.search("web-1", "x", &SearchOptions::default()),
        Err(WatchError::NotFound(_))
    ));
    assert_eq!(source.opens_for("web-1").len(), 1);
}

#[tokio::test]
async fn late_subscriber_gets_history_then_live_lines() {
    let source = Arc::new(ScriptedSource::default());
    let feed = source.live("web-1");
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    feed.send("one".to_string()).unwrap();
    feed.send("two".to_string()).unwrap();
    assert!(eventually(|| messages(&service, "web-1").len() == 2).await);

    let mut sub = service.stream_all();
    feed.send("three".to_string()).unwrap();

    for expected in ["one", "two", "three"] {
        assert_eq!(next_message(&mut sub).await, PodLogMessage::new("web-1", expected));
    }
}

#[tokio::test]
async fn each_subscriber_has_its_own_cursor() {
    let source = Arc::new(ScriptedSource::default());
    let feed = source.live("web-1");
    let service = service_with(&source);

    let mut first = service.stream_all();
    service.watch("web-1").unwrap();
    feed.send("a".to_string()).unwrap();
    assert_eq!(next_message(&mut first).await.message, "a");

    let mut second = service.stream_all();
    feed.send("b".to_string()).unwrap();
    assert_eq!(next_message(&mut first).await.message, "b");
    assert_eq!(next_message(&mut second).await.message, "a");
    assert_eq!(next_message(&mut second).await.message, "b");
}

#[tokio::test]
async fn per_pod_order_is_preserved() {
    let source = Arc::new(ScriptedSource::default());
    let feed_a = source.live("pod-a");
    let feed_b = source.live("pod-b");
    let service = service_with(&source);

    let mut sub = service.stream_all();
    service.watch_many(["pod-a", "pod-b"]).unwrap();
    for i in 0..100 {
        feed_a.send(format!("a{i}")).unwrap();
        feed_b.send(format!("b{i}")).unwrap();
    }

    let mut seen_a = Vec::new();
    let mut seen_b = Vec::new();
    while seen_a.len() < 100 || seen_b.len() < 100 {
        let msg = next_message(&mut sub).await;
        match msg.pod.as_str() {
            "pod-a" => seen_a.push(msg.message),
            _ => seen_b.push(msg.message),
        }
    }

    let expected_a: Vec<String> = (0..100).map(|i| format!("a{i}")).collect();
    let expected_b: Vec<String> = (0..100).map(|i| format!("b{i}")).collect();
    assert_eq!(seen_a, expected_a);
    assert_eq!(seen_b, expected_b);
}

#[tokio::test]
async fn unwatching_one_pod_leaves_the_other_alone() {
    let source = Arc::new(ScriptedSource::default());
    let feed_a = source.live("a");
    let feed_b = source.live("b");
    let service = service_with(&source);

    let mut sub = service.stream_all();
    service.watch_many(["a", "b"]).unwrap();
    feed_a.send("a1".to_string()).unwrap();
    feed_b.send("b1".to_string()).unwrap();
    assert!(eventually(|| messages(&service, "a").len() == 1 && messages(&service, "b").len() == 1).await);

    service.unwatch("a").unwrap();
    // The reader's stream is dropped promptly on cancellation
    tokio::time::timeout(Duration::from_secs(2), feed_a.closed())
        .await
        .expect("stream for unwatched pod was not released");

    feed_b.send("b2 error".to_string()).unwrap();

    let mut delivered = Vec::new();
    while !delivered.contains(&PodLogMessage::new("b", "b2 error")) {
        delivered.push(next_message(&mut sub).await);
    }
    assert!(delivered.contains(&PodLogMessage::new("a", "a1")));
    assert!(delivered.contains(&PodLogMessage::new("b", "b1")));

    let result = service.search("b", "error", &SearchOptions::default()).unwrap();
    assert_eq!(result.matches, vec!["b2 error"]);
    assert_eq!(service.status("b").unwrap(), WatchStatus::Streaming);
    assert!(matches!(service.status("a"), Err(WatchError::NotFound(_))));
}

#[tokio::test]
async fn search_all_reports_only_matching_pods() {
    let source = Arc::new(ScriptedSource::default());
    source.script("api-0", vec![Session::Open(vec!["GET /health 200", "panic: nil map"])]);
    source.script("api-1", vec![Session::Open(vec!["GET /health 200"])]);
    let service = service_with(&source);

    service.watch_many(["api-0", "api-1"]).unwrap();
    assert!(eventually(|| messages(&service, "api-0").len() == 2 && messages(&service, "api-1").len() == 1).await);

    let results = service.search_all("PANIC", &SearchOptions::default()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].pod_name, "api-0");
    assert_eq!(results[0].matches, vec!["panic: nil map"]);
}

#[tokio::test]
async fn buffer_capacity_bounds_history() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Open(vec!["a", "b", "c"])]);
    let config = WatcherConfig {
        buffer_capacity: 2,
        ..test_config()
    };
    let service = WatcherService::new(source.clone(), config);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1") == vec!["b", "c"]).await);
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let source = Arc::new(ScriptedSource::default());
    let feed = source.live("web-1");
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| source.opens_for("web-1").len() == 1).await);
    let mut sub = service.stream_all();
    service.shutdown().await;

    assert!(service.watched().is_empty());
    assert!(sub.next().await.is_none());
    tokio::time::timeout(Duration::from_secs(2), feed.closed())
        .await
        .expect("stream was not released on shutdown");
    assert!(matches!(service.watch("web-2"), Err(WatchError::ShutDown)));
}

#[tokio::test]
async fn out_of_order_timestamps_are_all_kept() {
    let source = Arc::new(ScriptedSource::default());
    // stdout and stderr are stamped independently, so stamps can go backwards
    source.script(
        "web-1",
        vec![Session::Open(vec![
            "2024-01-15T10:00:02.000000200Z stdout line",
            "2024-01-15T10:00:02.000000100Z stderr line",
            "2024-01-15T10:00:03Z later",
        ])],
    );
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1").len() == 3).await);
    assert_eq!(
        messages(&service, "web-1"),
        vec!["stdout line", "stderr line", "later"]
    );
}

#[tokio::test]
async fn ended_stream_reports_disconnected() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Closed(vec!["bye"])]);
    let config = WatcherConfig {
        backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(1)),
        ..WatcherConfig::default()
    };
    let service = WatcherService::new(source.clone(), config);

    service.watch("web-1").unwrap();
    assert!(eventually(|| service.status("web-1").ok() == Some(WatchStatus::Disconnected)).await);
    assert!(!service.is_open("web-1"));
    assert_eq!(messages(&service, "web-1"), vec!["bye"]);
}

#[tokio::test]
async fn backoff_resets_after_a_successful_line() {
    let source = Arc::new(ScriptedSource::default());
    source.script(
        "web-1",
        vec![Session::Fail, Session::Fail, Session::Closed(vec!["ok"])],
    );
    let config = WatcherConfig {
        backoff: BackoffConfig {
            initial_ms: 50,
            max_ms: 5_000,
            multiplier: 4.0,
        },
        ..WatcherConfig::default()
    };
    let service = WatcherService::new(source.clone(), config);

    service.watch("web-1").unwrap();
    assert!(eventually(|| source.open_times_for("web-1").len() >= 4).await);

    let at = source.open_times_for("web-1");
    // Second failure waited 200ms; after a line the delay is back to 50ms, not 800ms
    assert!(at[2] - at[1] >= Duration::from_millis(200));
    assert!(at[3] - at[2] < Duration::from_millis(500));
}

#[tokio::test]
async fn silent_pod_is_open_while_connecting() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Open(vec![])]);
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| service.is_open("web-1")).await);
    assert_eq!(service.status("web-1").unwrap(), WatchStatus::Connecting);
    assert!(!service.is_open("web-2"));
}

#[tokio::test]
async fn zero_limit_returns_every_match() {
    let source = Arc::new(ScriptedSource::default());
    source.script("web-1", vec![Session::Open(vec!["hit a", "hit b", "miss"])]);
    let service = service_with(&source);

    service.watch("web-1").unwrap();
    assert!(eventually(|| messages(&service, "web-1").len() == 3).await);

    let result = service
        .search("web-1", "hit", &SearchOptions::default().with_limit(0))
        .unwrap();
    assert_eq!(result.matches, vec!["hit a", "hit b"]);
}

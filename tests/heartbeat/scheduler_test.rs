//! Tests for `src/heartbeat/mod.rs`: cadence, failure escalation, and the
//! start/stop contract.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hearth::heartbeat::{HeartbeatScheduler, HeartbeatSettings, TaskRunner, NO_REPLY_MARKER};

use crate::support::{settle, MemoryStore};

const OWNER: &str = "15551234567@s.whatsapp.net";

/// Runner that replays a script; an exhausted script keeps failing.
#[derive(Default)]
struct ScriptedRunner {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<String, String>>>,
}

impl ScriptedRunner {
    fn new(script: Vec<Result<&str, &str>>) -> Arc<Self> {
        let script = script
            .into_iter()
            .map(|r| r.map(str::to_owned).map_err(str::to_owned))
            .collect();
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, _tasks: &[String]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().expect("lock").pop_front() {
            Some(Ok(summary)) => Ok(summary),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Err(anyhow::anyhow!("model offline")),
        }
    }
}

fn settings(notify_after_failures: u32) -> HeartbeatSettings {
    HeartbeatSettings {
        interval: Duration::from_secs(60),
        notify_after_failures,
        tasks: vec!["check the calendar".to_owned()],
    }
}

fn scheduler(
    runner: &Arc<ScriptedRunner>,
    store: &Arc<MemoryStore>,
    notify_after_failures: u32,
) -> HeartbeatScheduler {
    HeartbeatScheduler::new(
        runner.clone(),
        store.clone(),
        store.clone(),
        settings(notify_after_failures),
    )
}

async fn advance(d: Duration) {
    tokio::time::advance(d).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn failing_runner_keeps_a_fixed_cadence() {
    let runner = ScriptedRunner::new(Vec::new());
    let store = MemoryStore::with_last("whatsapp", OWNER);
    let hb = scheduler(&runner, &store, 3);

    hb.start();
    settle().await;
    assert_eq!(runner.calls(), 1, "first tick runs immediately");

    for expected in 2..=6 {
        advance(Duration::from_secs(59)).await;
        assert_eq!(runner.calls(), expected - 1, "no early tick");
        advance(Duration::from_secs(1)).await;
        assert_eq!(runner.calls(), expected);
    }
    assert_eq!(hb.consecutive_failures(), 6);

    let rows = store.rows();
    assert_eq!(rows.len(), 1, "exactly one notification at the threshold");
    assert_eq!(rows[0].user_id, OWNER);
    assert!(rows[0].text.contains("failed 3 times in a row"));
    assert!(rows[0].text.contains("model offline"));

    hb.stop();
}

#[tokio::test]
async fn recovery_resets_the_counter_and_allows_another_notice() {
    let runner = ScriptedRunner::new(vec![
        Err("boom"),
        Err("boom"),
        Ok(NO_REPLY_MARKER),
        Err("again"),
        Err("again"),
    ]);
    let store = MemoryStore::with_last("whatsapp", OWNER);
    let hb = scheduler(&runner, &store, 2);

    assert_eq!(hb.run_tick().await.consecutive_failures, 1);
    assert_eq!(hb.run_tick().await.consecutive_failures, 2);
    let ok = hb.run_tick().await;
    assert!(ok.success);
    assert_eq!(hb.consecutive_failures(), 0);
    hb.run_tick().await;
    hb.run_tick().await;

    let texts: Vec<String> = store.rows().into_iter().map(|r| r.text).collect();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("Last error: boom"));
    assert!(texts[1].contains("Last error: again"));
}

#[tokio::test]
async fn summaries_are_enqueued_but_no_reply_is_not() {
    let runner = ScriptedRunner::new(vec![
        Ok("You have a dentist appointment at 3pm."),
        Ok(NO_REPLY_MARKER),
        Ok("   "),
    ]);
    let store = MemoryStore::with_last("whatsapp", OWNER);
    let hb = scheduler(&runner, &store, 3);

    for _ in 0..3 {
        assert!(hb.run_tick().await.success);
    }

    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].channel, "whatsapp");
    assert_eq!(rows[0].text, "You have a dentist appointment at 3pm.");
}

#[tokio::test]
async fn nothing_is_enqueued_without_a_last_channel() {
    let runner = ScriptedRunner::new(vec![Ok("summary"), Err("x"), Err("x")]);
    let store = MemoryStore::new();
    let hb = scheduler(&runner, &store, 2);

    for _ in 0..3 {
        hb.run_tick().await;
    }
    assert!(store.rows().is_empty());
    assert_eq!(hb.consecutive_failures(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_twice_and_stop_twice_are_harmless() {
    let runner = ScriptedRunner::new(vec![Ok(NO_REPLY_MARKER); 10]);
    let store = MemoryStore::with_last("whatsapp", OWNER);
    let hb = scheduler(&runner, &store, 3);

    hb.stop();
    assert!(!hb.is_running());

    hb.start();
    hb.start();
    settle().await;
    assert!(hb.is_running());
    assert_eq!(runner.calls(), 1, "one timer, one immediate tick");

    hb.stop();
    hb.stop();
    assert!(!hb.is_running());

    advance(Duration::from_secs(600)).await;
    assert_eq!(runner.calls(), 1, "no ticks after stop");
}

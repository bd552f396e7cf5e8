//! End-to-end tests against real child processes.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use execd::Accumulator;
use execd::ChannelAccumulator;
use execd::DataFormat;
use execd::DeliveryInfo;
use execd::Emitted;
use execd::Execd;
use execd::ExecdConfig;
use execd::ExecdError;
use execd::FieldValue;
use execd::Lifecycle;
use execd::Metric;
use execd::TrackedMetric;
use similar_asserts::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tokio::time::timeout;

const MULTIPLIER: &str = env!("CARGO_BIN_EXE_count-multiplier");

type Seen = Arc<Mutex<Vec<DeliveryInfo>>>;

fn multiplier() -> ExecdConfig {
    ExecdConfig::new([MULTIPLIER])
        .with_env("FIELD_NAME", "count")
        .with_restart_delay(Duration::from_millis(200))
}

fn start_accumulator() -> (Arc<dyn Accumulator>, UnboundedReceiver<Emitted>) {
    let (acc, rx) = ChannelAccumulator::new();
    (Arc::new(acc), rx)
}

async fn next(rx: &mut UnboundedReceiver<Emitted>) -> Emitted {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for output")
        .expect("accumulator closed")
}

fn track(seen: &Seen, metric: Metric) -> TrackedMetric {
    let sink = Arc::clone(seen);
    TrackedMetric::new(metric, move |info| sink.lock().unwrap().push(info))
}

fn delivered(seen: &Seen) -> Vec<bool> {
    seen.lock().unwrap().iter().map(|info| info.delivered).collect()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn city(name: &str, population: i64, count: i64, timestamp: i64) -> Metric {
    Metric::now("test")
        .with_tag("city", name)
        .with_field("population", population)
        .with_field("count", count)
        .with_timestamp(timestamp)
}

#[test_log::test(tokio::test)]
async fn test_outputs_arrive_in_input_order() {
    let execd = Execd::new(multiplier()).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let origin = 1_700_000_000_000_000_000;
    for i in 0..10 {
        execd.add(city("Toronto", 6_000_000, 1, origin + i)).await.unwrap();
    }

    let first = next(&mut rx).await.accept();
    // queued metrics are still flushed through the child while stopping
    execd.stop().await;
    assert_eq!(first, city("Toronto", 6_000_000, 2, origin));

    let mut timestamp = first.timestamp;
    for _ in 0..9 {
        let metric = next(&mut rx).await.accept();
        assert_eq!(metric.timestamp, timestamp + 1);
        assert_eq!(metric.field("count"), Some(&FieldValue::Integer(2)));
        timestamp = metric.timestamp;
    }
}

#[test_log::test(tokio::test)]
async fn test_string_fields_with_line_breaks() {
    let execd = Execd::new(multiplier()).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let phrase = "Gophers are amazing creatures.\nAbsolutely amazing.";
    let input = Metric::now("test")
        .with_tag("author", "Mr. Gopher")
        .with_field("phrase", phrase)
        .with_field("count", 3i64);
    execd.add(input.clone()).await.unwrap();

    let output = next(&mut rx).await.accept();
    execd.stop().await;

    assert_eq!(output, input.with_field("count", 6i64));
}

#[test_log::test(tokio::test)]
async fn test_tracked_inputs_resolve_after_outputs_accepted() {
    let execd = Execd::new(multiplier()).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    let now = 1_600_000_000_000_000_000;
    execd
        .add(track(&seen, city("Toronto", 6_000_000, 1, now)))
        .await
        .unwrap();
    execd
        .add(track(&seen, city("Tokio", 14_000_000, 8, now)))
        .await
        .unwrap();

    let first = next(&mut rx).await;
    let second = next(&mut rx).await;
    assert!(first.is_tracked() && second.is_tracked());
    assert_eq!(first.metric(), &city("Toronto", 6_000_000, 2, now));
    assert_eq!(second.metric(), &city("Tokio", 14_000_000, 16, now));
    assert!(delivered(&seen).is_empty());

    first.accept();
    second.accept();
    assert!(eventually(|| delivered(&seen).len() == 2).await);
    assert_eq!(delivered(&seen), vec![true, true]);
    assert_eq!(execd.pending_deliveries(), 0);

    execd.stop().await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_dropped_output_is_not_delivered() {
    let execd = Execd::new(multiplier()).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd
        .add(track(&seen, city("Oslo", 700_000, 2, 1)))
        .await
        .unwrap();
    drop(next(&mut rx).await);

    assert!(eventually(|| delivered(&seen).len() == 1).await);
    assert_eq!(delivered(&seen), vec![false]);
    execd.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_restarts_after_unexpected_exit() {
    let execd = Execd::new(multiplier().with_env("EXIT_AFTER", "1")).unwrap();
    let (acc, mut rx) = start_accumulator();
    let mut state = execd.subscribe_state();
    execd.start(acc).await.unwrap();

    execd.add(city("Lima", 10, 1, 1)).await.unwrap();
    assert_eq!(next(&mut rx).await.accept().field("count"), Some(&FieldValue::Integer(2)));

    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == Lifecycle::Restarting),
    )
    .await
    .expect("never restarted")
    .unwrap();
    assert!(eventually(|| execd.state() == Lifecycle::Running).await);
    assert_eq!(execd.restart_count(), 1);

    execd.add(city("Lima", 10, 5, 2)).await.unwrap();
    assert_eq!(next(&mut rx).await.accept().field("count"), Some(&FieldValue::Integer(10)));
    execd.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_start_fails_when_program_is_missing() {
    let execd = Execd::new(ExecdConfig::new(["/nonexistent/transform"])).unwrap();
    let (acc, _rx) = start_accumulator();
    let err = execd.start(acc).await.unwrap_err();
    assert!(matches!(err.current_context(), ExecdError::Spawn { .. }));
    assert_eq!(execd.state(), Lifecycle::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_lifecycle_misuse() {
    let execd = Execd::new(multiplier()).unwrap();
    let seen = Seen::default();

    let err = execd.add(track(&seen, city("Rome", 1, 1, 1))).await.unwrap_err();
    assert!(matches!(err.current_context(), ExecdError::NotRunning { .. }));
    assert_eq!(delivered(&seen), vec![false]);

    let (acc, _rx) = start_accumulator();
    execd.start(Arc::clone(&acc)).await.unwrap();
    let err = execd.start(acc).await.unwrap_err();
    assert!(matches!(err.current_context(), ExecdError::AlreadyRunning { .. }));

    execd.stop().await;
    assert_eq!(execd.state(), Lifecycle::Stopped);
    execd.stop().await;
    assert_eq!(execd.state(), Lifecycle::Stopped);

    let err = execd.add(city("Rome", 1, 1, 1)).await.unwrap_err();
    assert!(matches!(err.current_context(), ExecdError::NotRunning { .. }));
}

#[test_log::test(tokio::test)]
async fn test_stop_kills_child_ignoring_stdin() {
    let config = ExecdConfig::new(["sleep", "30"]).with_stop_timeout(Duration::from_millis(300));
    let execd = Execd::new(config).unwrap();
    let (acc, _rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd.add(track(&seen, city("Cairo", 1, 1, 1))).await.unwrap();

    timeout(Duration::from_secs(5), execd.stop())
        .await
        .expect("stop hung");
    assert_eq!(execd.state(), Lifecycle::Stopped);
    assert_eq!(delivered(&seen), vec![false]);
}

#[test_log::test(tokio::test)]
async fn test_stop_releases_blocked_add() {
    let config = ExecdConfig::new(["sleep", "30"])
        .with_queue_capacity(1)
        .with_stop_timeout(Duration::from_millis(300));
    let execd = Arc::new(Execd::new(config).unwrap());
    let (acc, _rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    // larger than a pipe buffer, so the first write never completes
    let payload = "x".repeat(256 * 1024);
    let big = || Metric::now("blob").with_field("payload", payload.as_str());
    let seen = Seen::default();

    execd.add(track(&seen, big())).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    execd.add(track(&seen, big())).await.unwrap();

    let blocked = tokio::spawn({
        let execd = Arc::clone(&execd);
        let tracked = track(&seen, big());
        async move { execd.add(tracked).await }
    });
    sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished());

    timeout(Duration::from_secs(5), execd.stop())
        .await
        .expect("stop hung");
    let err = blocked.await.unwrap().unwrap_err();
    assert!(matches!(err.current_context(), ExecdError::Stopped { .. }));

    assert_eq!(delivered(&seen), vec![false, false, false]);
}

#[test_log::test(tokio::test)]
async fn test_stop_resolves_inputs_without_output() {
    let execd = Execd::new(ExecdConfig::new(["sh", "-c", "cat > /dev/null"])).unwrap();
    let (acc, _rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    for i in 0..3 {
        execd.add(track(&seen, city("Quito", 1, 1, i))).await.unwrap();
    }
    execd.stop().await;

    assert_eq!(delivered(&seen), vec![false, false, false]);
    assert_eq!(execd.pending_deliveries(), 0);
}

#[test_log::test(tokio::test)]
async fn test_several_outputs_per_input() {
    let config = multiplier()
        .with_env("COPIES", "2")
        .with_outputs_per_input(2);
    let execd = Execd::new(config).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd.add(track(&seen, city("Nairobi", 1, 4, 1))).await.unwrap();

    let first = next(&mut rx).await;
    let second = next(&mut rx).await;
    assert_eq!(first.metric(), second.metric());

    first.accept();
    sleep(Duration::from_millis(100)).await;
    assert!(delivered(&seen).is_empty());

    second.accept();
    assert!(eventually(|| delivered(&seen) == vec![true]).await);
    execd.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_uncorrelated_outputs_resolve_on_write() {
    let execd = Execd::new(multiplier().with_outputs_per_input(0)).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd.add(track(&seen, city("Lagos", 1, 1, 1))).await.unwrap();

    let output = next(&mut rx).await;
    assert!(!output.is_tracked());
    assert!(eventually(|| delivered(&seen) == vec![true]).await);
    execd.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_json_wire_format() {
    let config = multiplier()
        .with_env("DATA_FORMAT", "json")
        .with_data_format(DataFormat::Json);
    let execd = Execd::new(config).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let input = Metric::now("sensor")
        .with_tag("room", "kitchen")
        .with_field("count", 2.5)
        .with_field("note", "line\nbreak");
    execd.add(input.clone()).await.unwrap();

    let output = next(&mut rx).await.accept();
    execd.stop().await;
    assert_eq!(output, input.with_field("count", 5.0));
}

#[test_log::test(tokio::test)]
async fn test_malformed_output_is_skipped() {
    let script = "printf 'not a metric\\ncpu value=1i 7\\n'; cat > /dev/null";
    let execd = Execd::new(ExecdConfig::new(["sh", "-c", script])).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let output = next(&mut rx).await.accept();
    execd.stop().await;
    assert_eq!(output, Metric::now("cpu").with_field("value", 1i64).with_timestamp(7));
}

#[test_log::test(tokio::test)]
async fn test_stop_interrupts_restart_delay() {
    let config = ExecdConfig::new(["sh", "-c", "exit 1"]).with_restart_delay(Duration::from_secs(30));
    let execd = Execd::new(config).unwrap();
    let (acc, _rx) = start_accumulator();
    let mut state = execd.subscribe_state();
    execd.start(acc).await.unwrap();

    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == Lifecycle::Restarting),
    )
    .await
    .expect("never restarted")
    .unwrap();

    timeout(Duration::from_secs(2), execd.stop())
        .await
        .expect("stop waited out the restart delay");
    assert_eq!(execd.state(), Lifecycle::Stopped);
    assert_eq!(execd.restart_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_crash_resolves_in_flight_input() {
    let config = multiplier()
        .with_env("EXIT_AFTER", "1")
        .with_env("COPIES", "0");
    let execd = Execd::new(config).unwrap();
    let (acc, _rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd.add(track(&seen, city("Dakar", 1, 1, 1))).await.unwrap();

    assert!(eventually(|| !delivered(&seen).is_empty()).await);
    assert!(eventually(|| execd.restart_count() >= 1).await);
    execd.stop().await;

    assert_eq!(delivered(&seen), vec![false]);
    assert_eq!(execd.pending_deliveries(), 0);
}

#[test_log::test(tokio::test)]
async fn test_unencodable_metric_is_dropped() {
    let execd = Execd::new(multiplier()).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd.add(track(&seen, Metric::now("empty"))).await.unwrap();
    execd.add(track(&seen, city("Accra", 1, 3, 1))).await.unwrap();

    let output = next(&mut rx).await;
    assert_eq!(output.metric(), &city("Accra", 1, 6, 1));
    assert_eq!(delivered(&seen), vec![false]);

    output.accept();
    assert!(eventually(|| delivered(&seen).len() == 2).await);
    assert_eq!(delivered(&seen), vec![false, true]);
    execd.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_closed_stdin_restarts_process() {
    let config = ExecdConfig::new(["sh", "-c", "exec 0<&-; sleep 30"])
        .with_restart_delay(Duration::from_millis(200))
        .with_stop_timeout(Duration::from_millis(300));
    let execd = Execd::new(config).unwrap();
    let (acc, _rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    // the first writes may land before the child closed its end
    for i in 0..50 {
        execd.add(city("Lisbon", 1, 1, i)).await.unwrap();
        if execd.restart_count() > 0 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(execd.restart_count() >= 1);

    timeout(Duration::from_secs(5), execd.stop())
        .await
        .expect("stop hung");
    assert_eq!(execd.state(), Lifecycle::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_malformed_output_counts_against_its_input() {
    let script = "read -r line; echo 'not a metric'; \
                  while read -r line; do printf '%s\\n' \"$line\"; done";
    let execd = Execd::new(ExecdConfig::new(["sh", "-c", script])).unwrap();
    let (acc, mut rx) = start_accumulator();
    execd.start(acc).await.unwrap();

    let seen = Seen::default();
    execd.add(track(&seen, city("Lusaka", 1, 1, 1))).await.unwrap();
    execd.add(track(&seen, city("Harare", 2, 2, 2))).await.unwrap();

    let output = next(&mut rx).await;
    assert_eq!(output.metric(), &city("Harare", 2, 2, 2));
    assert!(eventually(|| delivered(&seen) == vec![false]).await);

    output.accept();
    assert!(eventually(|| delivered(&seen) == vec![false, true]).await);
    execd.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_unsigned_fields_are_doubled() {
    for format in [DataFormat::Influx, DataFormat::Json] {
        let config = multiplier()
            .with_env("DATA_FORMAT", format.to_string())
            .with_data_format(format);
        let execd = Execd::new(config).unwrap();
        let (acc, mut rx) = start_accumulator();
        execd.start(acc).await.unwrap();

        let input = Metric::now("disk").with_field("count", 21u64).with_timestamp(9);
        execd.add(input.clone()).await.unwrap();

        let output = next(&mut rx).await.accept();
        execd.stop().await;
        assert_eq!(output, input.with_field("count", 42u64), "format {format}");
    }
}

//! Buffers log records and publishes them as response frames.
//!
//! Records stream in from the installer and executor, are batched, and are
//! flushed on an interval or immediately when a terminal record arrives.
//! The full history is kept for backfill requests and for replaying a
//! completed task's logs when the manager redelivers it.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use convoy_model::{LogRecord, OrderId, Response, TargetId, Topic, UnixTime};
use convoy_pipe::{AgentSender, Message};

/// Commands the installer can issue to the responder.
#[derive(Debug)]
pub enum ResponderCommand {
    /// Send every log newer than the watermark, flagged `on_request`.
    Backfill(UnixTime),

    /// Re-send all logs of a completed task.
    Replay(OrderId),

    /// Flush the buffer now.
    Flush,
}

/// Handle for feeding the responder.
#[derive(Debug, Clone)]
pub struct ResponderHandle {
    logs: mpsc::Sender<LogRecord>,
    commands: mpsc::Sender<ResponderCommand>,
}

impl ResponderHandle {
    /// The log sink for executors.
    #[must_use]
    pub fn log_sink(&self) -> mpsc::Sender<LogRecord> {
        self.logs.clone()
    }

    /// Record one log line.
    pub async fn log(&self, record: LogRecord) {
        if self.logs.send(record).await.is_err() {
            warn!("responder gone, log lost");
        }
    }

    /// Answer a backfill request.
    pub async fn backfill(&self, since: UnixTime) {
        let _ = self.commands.send(ResponderCommand::Backfill(since)).await;
    }

    /// Replay a completed task's logs.
    pub async fn replay(&self, task: OrderId) {
        let _ = self.commands.send(ResponderCommand::Replay(task)).await;
    }

    /// Flush buffered logs now.
    pub async fn flush(&self) {
        let _ = self.commands.send(ResponderCommand::Flush).await;
    }
}

/// Spawn the responder loop for `target`, publishing through `sender`.
#[must_use]
pub fn spawn(target: TargetId, sender: AgentSender, flush_interval: Duration) -> ResponderHandle {
    let (log_tx, log_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(32);

    tokio::spawn(run(target, sender, flush_interval, log_rx, command_rx));

    ResponderHandle {
        logs: log_tx,
        commands: command_tx,
    }
}

async fn run(
    target: TargetId,
    sender: AgentSender,
    flush_interval: Duration,
    mut logs: mpsc::Receiver<LogRecord>,
    mut commands: mpsc::Receiver<ResponderCommand>,
) {
    let mut buffer: Vec<LogRecord> = Vec::new();
    let mut history: Vec<LogRecord> = Vec::new();
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            record = logs.recv() => {
                let Some(record) = record else { break };
                let terminal = record.is_stage_end();
                history.push(record.clone());
                buffer.push(record);
                if terminal {
                    flush(&target, &sender, &mut buffer).await;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    ResponderCommand::Backfill(since) => {
                        // Flush first so the backfill covers everything.
                        flush(&target, &sender, &mut buffer).await;
                        let newer: Vec<LogRecord> = history
                            .iter()
                            .filter(|log| log.time > since)
                            .cloned()
                            .collect();
                        debug!(count = newer.len(), since = %since, "answering log request");
                        publish(&target, &sender, newer, true).await;
                    }
                    ResponderCommand::Replay(task) => {
                        let logs: Vec<LogRecord> = history
                            .iter()
                            .filter(|log| log.task == task)
                            .cloned()
                            .collect();
                        debug!(task = %task, count = logs.len(), "replaying task logs");
                        publish(&target, &sender, logs, false).await;
                    }
                    ResponderCommand::Flush => {
                        flush(&target, &sender, &mut buffer).await;
                    }
                }
            }
            _ = interval.tick() => {
                flush(&target, &sender, &mut buffer).await;
            }
        }
    }

    // Final drain on shutdown.
    flush(&target, &sender, &mut buffer).await;
}

async fn flush(target: &TargetId, sender: &AgentSender, buffer: &mut Vec<LogRecord>) {
    if buffer.is_empty() {
        return;
    }
    let logs = std::mem::take(buffer);
    publish(target, sender, logs, false).await;
}

async fn publish(target: &TargetId, sender: &AgentSender, logs: Vec<LogRecord>, on_request: bool) {
    if logs.is_empty() && !on_request {
        return;
    }
    let response = Response {
        target_id: target.clone(),
        logs,
        on_request,
    };
    let message = match Message::json(&Topic::Log, &response) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "unable to encode response");
            return;
        }
    };
    if sender.send(message).await.is_err() {
        warn!("pipe closed, response lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_model::{Stage, STAGE_END};
    use convoy_pipe::{pipe, MemoryBroker};

    fn record(task: &str, output: &str, time: i64) -> LogRecord {
        LogRecord {
            task: OrderId::new(task),
            target: TargetId::new("t1"),
            stage: Stage::Install,
            command: "c".to_owned(),
            output: output.to_owned(),
            error: false,
            time: UnixTime::from_secs(time),
            debug: false,
        }
    }

    async fn next_response(core: &mut convoy_pipe::Pipe) -> Response {
        let message = tokio::time::timeout(Duration::from_secs(2), core.responses.recv())
            .await
            .expect("timely")
            .expect("frame");
        assert_eq!(message.topic, "RES/LOG");
        serde_json::from_slice(&message.payload).expect("decode")
    }

    #[tokio::test]
    async fn terminal_records_flush_immediately() {
        let (mut core, backend) = pipe(16);
        let broker = MemoryBroker::start(backend, 16);
        let conn = broker.attach(Vec::new());

        let handle = spawn(
            TargetId::new("t1"),
            conn.sender(),
            Duration::from_secs(3600),
        );

        handle.log(record("o1", "hi", 1)).await;
        handle.log(record("o1", STAGE_END, 2)).await;

        let response = next_response(&mut core).await;
        assert_eq!(response.target_id, TargetId::new("t1"));
        assert!(!response.on_request);
        assert_eq!(response.logs.len(), 2);
        assert_eq!(response.logs[0].output, "hi");
        assert_eq!(response.logs[1].output, STAGE_END);
    }

    #[tokio::test]
    async fn backfill_returns_only_newer_logs() {
        let (mut core, backend) = pipe(16);
        let broker = MemoryBroker::start(backend, 16);
        let conn = broker.attach(Vec::new());

        let handle = spawn(
            TargetId::new("t1"),
            conn.sender(),
            Duration::from_secs(3600),
        );

        handle.log(record("o1", "old", 100)).await;
        handle.log(record("o1", "new-1", 101)).await;
        handle.log(record("o1", "new-2", 103)).await;
        handle.flush().await;
        let _initial = next_response(&mut core).await;

        handle.backfill(UnixTime::from_secs(100)).await;

        let response = next_response(&mut core).await;
        assert!(response.on_request);
        assert_eq!(response.logs.len(), 2);
        assert_eq!(response.logs[0].output, "new-1");
        assert_eq!(response.logs[1].output, "new-2");
    }

    #[tokio::test]
    async fn replay_filters_by_task() {
        let (mut core, backend) = pipe(16);
        let broker = MemoryBroker::start(backend, 16);
        let conn = broker.attach(Vec::new());

        let handle = spawn(
            TargetId::new("t1"),
            conn.sender(),
            Duration::from_secs(3600),
        );

        handle.log(record("o1", "first", 1)).await;
        handle.log(record("o2", "second", 2)).await;
        handle.flush().await;
        let _initial = next_response(&mut core).await;

        handle.replay(OrderId::new("o1")).await;

        let response = next_response(&mut core).await;
        assert_eq!(response.logs.len(), 1);
        assert_eq!(response.logs[0].output, "first");
        assert_eq!(response.logs[0].task, OrderId::new("o1"));
    }
}

//! Event-driven streams.
//!
//! An [`EchoStream`] is the owner's view of one ordered, reliable byte channel
//! to a peer: a queue of [`StreamEvent`]s plus a [`StreamWriter`]. The other
//! half, [`StreamDriver`], is held by whoever produced the stream (the iroh
//! binding or the in-memory test network) and pumps frames between the real
//! reader/writer and the channels.
//!
//! Writes are queued until the driver starts, so an owner may write before
//! the connection is established.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::error::StreamError;
use crate::framing::{read_frame, write_frame, write_keep_alive};

/// Capacity of the event and command queues of a stream.
const STREAM_QUEUE_DEPTH: usize = 64;

/// Something that happened on a stream, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The connection is established. `remote` names the peer's address as
    /// far as the transport knows it.
    Connected { remote: String },
    /// One received frame. An empty frame is a keep-alive.
    Data(Bytes),
    /// The peer finished its sending side.
    End,
    /// The stream failed; `Closed` follows.
    Error(StreamError),
    /// Terminal event. Nothing follows it.
    Closed,
}

#[derive(Debug)]
enum Command {
    Write(Bytes),
    KeepAlive(Duration),
    End,
}

/// Sending half of a stream. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StreamWriter {
    tx: mpsc::Sender<Command>,
}

impl StreamWriter {
    /// Queue `data` as one frame.
    pub async fn write(&self, data: Bytes) -> Result<(), StreamError> {
        self.send(Command::Write(data)).await
    }

    /// Finish the sending side once all queued writes are flushed.
    pub async fn end(&self) -> Result<(), StreamError> {
        self.send(Command::End).await
    }

    /// Send a keep-alive frame whenever the stream has been idle for `interval`.
    pub async fn set_keep_alive(&self, interval: Duration) -> Result<(), StreamError> {
        self.send(Command::KeepAlive(interval)).await
    }

    async fn send(&self, command: Command) -> Result<(), StreamError> {
        self.tx.send(command).await.map_err(|_| StreamError::Closed)
    }
}

/// Owner's handle on one stream.
#[derive(Debug)]
pub struct EchoStream {
    events: mpsc::Receiver<StreamEvent>,
    writer: StreamWriter,
}

impl EchoStream {
    /// Create a stream and the driver that will service it.
    pub fn channel() -> (EchoStream, StreamDriver) {
        let (event_tx, event_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        let (command_tx, command_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        (
            EchoStream {
                events: event_rx,
                writer: StreamWriter { tx: command_tx },
            },
            StreamDriver {
                events: event_tx,
                commands: command_rx,
            },
        )
    }

    /// Wait for the next event. Once the driver is gone this keeps returning
    /// [`StreamEvent::Closed`].
    pub async fn next_event(&mut self) -> StreamEvent {
        self.events.recv().await.unwrap_or(StreamEvent::Closed)
    }

    pub async fn write(&self, data: Bytes) -> Result<(), StreamError> {
        self.writer.write(data).await
    }

    pub async fn end(&self) -> Result<(), StreamError> {
        self.writer.end().await
    }

    pub async fn set_keep_alive(&self, interval: Duration) -> Result<(), StreamError> {
        self.writer.set_keep_alive(interval).await
    }
}

/// Transport-side half of an [`EchoStream`].
#[derive(Debug)]
pub struct StreamDriver {
    events: mpsc::Sender<StreamEvent>,
    commands: mpsc::Receiver<Command>,
}

impl StreamDriver {
    /// Report that the stream could not be established.
    pub async fn fail(self, err: StreamError) {
        let _ = self.events.send(StreamEvent::Error(err)).await;
        let _ = self.events.send(StreamEvent::Closed).await;
    }

    /// Pump frames between `reader`/`writer` and the owner until both
    /// directions are finished or one of them fails.
    pub async fn run<R, W>(self, remote: String, mut reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let StreamDriver {
            events,
            mut commands,
        } = self;
        let _ = events
            .send(StreamEvent::Connected {
                remote: remote.clone(),
            })
            .await;

        let outcome = {
            let read_side = pump_reads(&events, &mut reader);
            let write_side = pump_writes(&mut commands, &mut writer);
            tokio::pin!(read_side);
            tokio::pin!(write_side);

            let mut read_done = false;
            let mut write_done = false;
            loop {
                if read_done && write_done {
                    break Ok(());
                }
                tokio::select! {
                    res = &mut read_side, if !read_done => {
                        read_done = true;
                        if let Err(err) = res {
                            break Err(err);
                        }
                    }
                    res = &mut write_side, if !write_done => {
                        write_done = true;
                        if let Err(err) = res {
                            break Err(err);
                        }
                    }
                }
            }
        };

        if let Err(err) = outcome {
            debug!(%remote, %err, "stream failed");
            let _ = events.send(StreamEvent::Error(err)).await;
        }
        let _ = events.send(StreamEvent::Closed).await;
    }
}

async fn pump_reads<R>(events: &mpsc::Sender<StreamEvent>, reader: &mut R) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(reader).await? {
            Some(frame) => {
                if events.send(StreamEvent::Data(frame)).await.is_err() {
                    // Owner dropped the stream; nobody is left to read.
                    return Ok(());
                }
            }
            None => {
                let _ = events.send(StreamEvent::End).await;
                return Ok(());
            }
        }
    }
}

async fn pump_writes<W>(commands: &mut mpsc::Receiver<Command>, writer: &mut W) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    let mut keep_alive: Option<Interval> = None;
    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            _ = idle_tick(&mut keep_alive) => {
                write_keep_alive(writer).await?;
                writer.flush().await?;
                continue;
            }
        };

        match command {
            Some(Command::Write(data)) => {
                write_frame(writer, &data).await?;
                writer.flush().await?;
                if let Some(interval) = keep_alive.as_mut() {
                    interval.reset();
                }
            }
            Some(Command::KeepAlive(period)) => {
                let mut interval = time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                keep_alive = Some(interval);
            }
            Some(Command::End) | None => {
                writer.shutdown().await?;
                return Ok(());
            }
        }
    }
}

async fn idle_tick(keep_alive: &mut Option<Interval>) {
    match keep_alive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

//! Serialises every bus transaction through one worker task.
//!
//! Callers hold a cheap [`Client`]; each call queues a frame on a FIFO channel
//! and waits for its outcome. The worker takes one frame at a time, waits out
//! the silent interval (dropping whatever arrives meanwhile), writes it, and
//! settles the caller with the next frame the transport receives. A failed
//! command only fails its own caller.

use std::time::Duration;

use bytes::Bytes;
use tokio::{io::{AsyncRead, AsyncWrite}, select, sync::{mpsc, oneshot}, time::{sleep, timeout}};
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::protocol::{commands::*, frame};
use crate::transport::{Framing, Transport};


pub const DEFAULT_SILENT_INTERVAL: Duration = Duration::from_millis(25);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Idle time before each transmission.
    pub silent_interval: Duration,

    /// How long to wait for a response before failing the command with `Timeout`.
    pub response_timeout: Duration,

    pub framing: Framing,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            silent_interval: DEFAULT_SILENT_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            framing: Framing::default()
        }
    }
}


struct Command {
    request: Bytes,
    outcome: oneshot::Sender<Result<Bytes>>,
}


pub struct Sequencer<T> {
    transport: Transport<T>,
    commands: mpsc::UnboundedReceiver<Command>,
    config: SequencerConfig,
}

impl<T> Sequencer<T> where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    /// Spawn the worker task owning `port` and return a handle for queueing commands.
    ///
    /// The worker stops once every `Client` has been dropped.
    pub fn spawn(port: T, config: SequencerConfig) -> Client {
        let (commands_send, commands_recv) = mpsc::unbounded_channel();

        let sequencer = Sequencer {
            transport: Transport::new(port, config.framing),
            commands: commands_recv,
            config
        };

        tokio::spawn(sequencer.run());

        Client { commands: commands_send }
    }

    async fn run(mut self) {
        loop {
            let command = select! {
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break
                },

                // nothing is in flight, so anything received now answers no one
                frame = self.transport.next_frame(), if !self.transport.is_closed() => {
                    match frame {
                        Ok(frame) => warn!("discarding unsolicited frame: {:02x?}", &frame[..]),
                        Err(err) => {
                            warn!("port error while idle: {err}");
                            self.transport.reset();
                        }
                    }
                    continue;
                }
            };

            let outcome = self.execute(&command.request).await;

            if let Err(err) = &outcome {
                warn!("command {:02x?} failed: {err}", &command.request[..]);
            }

            // the caller may have stopped waiting
            let _ = command.outcome.send(outcome);
        }

        debug!("command sequencer stopped");
    }

    /// Wait out the silent interval, discarding anything received meanwhile.
    ///
    /// A reply to a command that already timed out may still arrive here; it
    /// must not be taken for the answer to the next request.
    async fn quiet(&mut self) {
        let silence = sleep(self.config.silent_interval);
        tokio::pin!(silence);

        loop {
            select! {
                _ = &mut silence => break,

                frame = self.transport.next_frame(), if !self.transport.is_closed() => match frame {
                    Ok(frame) => warn!("discarding late frame: {:02x?}", &frame[..]),
                    Err(err) => {
                        warn!("port error while waiting to send: {err}");
                        self.transport.reset();
                    }
                }
            }
        }

        // partial frames too
        self.transport.reset();
    }

    async fn execute(&mut self, request: &[u8]) -> Result<Bytes> {
        self.quiet().await;

        self.transport.send(request).await?;
        debug!("[Sent] {:02x?}", request);

        let received = match timeout(self.config.response_timeout, self.transport.next_frame()).await {
            Ok(received) => received,
            Err(_) => Err(BusError::Timeout),
        };

        match received {
            Ok(response) => {
                debug!("[Received] {:02x?}", &response[..]);
                frame::validate(&response)
            },
            Err(err) => {
                self.transport.reset();
                Err(err)
            }
        }
    }
}


/// Handle to a running [`Sequencer`].
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Queue a prebuilt frame. Resolves with the validated response frame.
    pub async fn send_command(&self, frame: Bytes) -> Result<Bytes> {
        let (outcome_send, outcome_recv) = oneshot::channel();

        self.commands.send(Command { request: frame, outcome: outcome_send })
            .map_err(|_| BusError::Closed)?;

        outcome_recv.await.map_err(|_| BusError::Closed)?
    }

    pub async fn send_read_input_register_command(&self, slave: u8, start_register: u16, count: u16) -> Result<Bytes> {
        self.send_command(build_read_input_registers(slave, start_register, count)?).await
    }

    pub async fn send_preset_single_register_command(&self, slave: u8, register: u16, value: [u8; 2]) -> Result<Bytes> {
        self.send_command(build_write_single_register(slave, register, value)?).await
    }

    pub async fn send_preset_multiple_register_command(&self, slave: u8, register: u16, values: &[u8]) -> Result<Bytes> {
        self.send_command(build_write_multiple_registers(slave, register, values)?).await
    }

    /// Read `count` input registers and return just their data bytes.
    pub async fn read_input_registers(&self, slave: u8, start_register: u16, count: u16) -> Result<Bytes> {
        let response = self.send_read_input_register_command(slave, start_register, count).await?;
        let data = frame::register_data(&response, count)?;

        Ok(response.slice_ref(data))
    }
}

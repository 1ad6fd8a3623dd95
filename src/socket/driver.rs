//! 异步驱动器：在 tokio 任务上运行一个端点
//! Async driver: runs an endpoint on a tokio task
//!
//! The driver owns an [`Endpoint`]. It wakes up for application commands, inbound
//! datagrams and the earliest timer deadline, then flushes every queued segment to its
//! [`SegmentSink`] and every connection event to the application.

use super::{command::DriverCommand, sink::SegmentSink};
use crate::{
    core::{connection::ConnectionEvent, endpoint::Endpoint},
    error::{Error, Result},
    token::ConnectionHandle,
    transport::Datagram,
};
use bytes::Bytes;
use std::net::SocketAddrV4;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 128;

/// A cloneable handle to a running driver.
///
/// 运行中驱动器的可克隆句柄。
#[derive(Debug, Clone)]
pub struct DriverHandle {
    command_tx: mpsc::Sender<DriverCommand>,
}

impl DriverHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> DriverCommand) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        response_rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Opens a connection. Completion is reported by a `Connected` event.
    /// 打开连接，完成时会收到 `Connected` 事件。
    pub async fn connect(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Result<ConnectionHandle> {
        self.request(|response_tx| DriverCommand::Connect {
            local,
            remote,
            response_tx,
        })
        .await
    }

    pub async fn write(&self, handle: ConnectionHandle, data: Bytes) -> Result<usize> {
        self.request(|response_tx| DriverCommand::Write {
            handle,
            data,
            response_tx,
        })
        .await
    }

    pub async fn read(&self, handle: ConnectionHandle, max: usize) -> Result<Bytes> {
        self.request(|response_tx| DriverCommand::Read {
            handle,
            max,
            response_tx,
        })
        .await
    }

    pub async fn close(&self, handle: ConnectionHandle) -> Result<()> {
        self.request(|response_tx| DriverCommand::Close { handle, response_tx })
            .await
    }
}

/// The actor running an [`Endpoint`].
///
/// 运行 [`Endpoint`] 的 actor。
pub struct Driver<S: SegmentSink> {
    endpoint: Endpoint,
    sink: S,
    command_rx: mpsc::Receiver<DriverCommand>,
    inbound_rx: mpsc::Receiver<Datagram>,
    event_tx: mpsc::UnboundedSender<(ConnectionHandle, ConnectionEvent)>,
}

impl<S: SegmentSink> Driver<S> {
    /// Spawns the driver task. Returns the command handle and the stream of connection
    /// events. The task ends once every handle is dropped.
    ///
    /// 启动驱动任务，返回命令句柄和连接事件流。所有句柄被丢弃后任务结束。
    pub fn spawn(
        endpoint: Endpoint,
        sink: S,
        inbound_rx: mpsc::Receiver<Datagram>,
    ) -> (
        DriverHandle,
        mpsc::UnboundedReceiver<(ConnectionHandle, ConnectionEvent)>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Self {
            endpoint,
            sink,
            command_rx,
            inbound_rx,
            event_tx,
        };
        tokio::spawn(driver.run());
        (DriverHandle { command_tx }, event_rx)
    }

    async fn run(mut self) {
        info!("Driver started");
        let mut inbound_open = true;
        loop {
            self.flush().await;
            let deadline = self.endpoint.poll_timeout();
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                datagram = self.inbound_rx.recv(), if inbound_open => match datagram {
                    Some(datagram) => {
                        if let Err(err) = self.endpoint.handle_datagram(datagram, Instant::now()) {
                            debug!(error = %err, "Inbound segment rejected");
                        }
                    }
                    None => {
                        debug!("Inbound channel closed");
                        inbound_open = false;
                    }
                },
                _ = timer => self.endpoint.handle_timeout(Instant::now()),
            }
        }
        self.flush().await;
        info!(connections = self.endpoint.len(), "Driver stopped");
    }

    fn handle_command(&mut self, command: DriverCommand) {
        let now = Instant::now();
        match command {
            DriverCommand::Connect {
                local,
                remote,
                response_tx,
            } => {
                let _ = response_tx.send(self.endpoint.connect(local, remote, now));
            }
            DriverCommand::Write {
                handle,
                data,
                response_tx,
            } => {
                let result = self
                    .endpoint
                    .connection_mut(handle)
                    .ok_or(Error::UnknownConnection)
                    .and_then(|connection| connection.write(&data, now));
                let _ = response_tx.send(result);
            }
            DriverCommand::Read {
                handle,
                max,
                response_tx,
            } => {
                let result = self
                    .endpoint
                    .connection_mut(handle)
                    .ok_or(Error::UnknownConnection)
                    .map(|connection| connection.read(max));
                let _ = response_tx.send(result);
            }
            DriverCommand::Close { handle, response_tx } => {
                let result = self
                    .endpoint
                    .connection_mut(handle)
                    .ok_or(Error::UnknownConnection)
                    .and_then(|connection| connection.close(now));
                let _ = response_tx.send(result);
            }
        }
    }

    /// Sends every queued segment and forwards every pending event. Accepted
    /// connections announce themselves with their `Connected` event.
    async fn flush(&mut self) {
        while let Some(handle) = self.endpoint.accept() {
            debug!(connection = %handle, "Accepted connection");
        }
        while let Some(transmit) = self.endpoint.poll_transmit() {
            let dst = transmit.dst;
            if let Err(err) = self.sink.send(transmit).await {
                warn!(%dst, error = %err, "Failed to send segment");
            }
        }
        while let Some(event) = self.endpoint.poll_event() {
            // The application may have stopped listening.
            let _ = self.event_tx.send(event);
        }
    }
}

//! Discovery, periodic refresh and write-back of every unit behind the adaptor.
//!
//! An [`Engine`] owns the unit table and a [`Client`] of the command
//! sequencer. It can be driven directly, or spawned as a task that runs the
//! health-check and refresh timers and serves an [`EngineHandle`].

use std::time::Duration;

use bytes::BytesMut;
use tokio::{select, sync::{mpsc, oneshot, watch}, time::{interval, interval_at, Instant, MissedTickBehavior}};
use tracing::{debug, info, warn};

use crate::error::{BusError, Result};
use crate::protocol::addresses::*;
use crate::sequencer::Client;
use crate::unit::{CapabilityBlock, StatusBlock, Unit, UnitKind};


pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_secs(5);

/// Most unit blocks one multi-register write can carry.
pub const MAX_SEGMENT_UNITS: usize = (MAX_WRITE_REGISTERS / CONTROL_REGISTERS_PER_UNIT) as usize;

const ADAPTOR_READY: u16 = 0x0001;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub slave: u8,

    /// Retry period of discovery while the system is not initialized.
    pub discovery_interval: Duration,

    /// Period of the refresh cycle once initialized.
    pub refresh_interval: Duration,

    /// `sync()` calls this close to the previous one reuse its result.
    pub sync_debounce: Duration,

    /// Register number of unit 0's first control register.
    pub control_register_base: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slave: DEFAULT_SLAVE,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            sync_debounce: DEFAULT_SYNC_DEBOUNCE,
            control_register_base: CONTROL_FIRST
        }
    }
}


/// One slot per unit; `None` is an absent unit.
pub type UnitTable = [Option<Unit>; UNIT_COUNT];

/// Receives each present unit's freshly read status block.
pub type StatusCallback = Box<dyn FnMut(&Unit, &StatusBlock) + Send + Sync>;


/// A contiguous run of unit register blocks written in one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSegment {
    pub first_unit: u8,
    pub units: usize,
    pub data: Vec<u8>,
}

impl RegisterSegment {
    fn new(first_unit: usize) -> Self {
        Self {
            first_unit: first_unit as u8,
            units: 0,
            data: Vec::with_capacity(MAX_WRITE_REGISTERS as usize * 2)
        }
    }

    fn push(&mut self, block: &[u8]) {
        self.data.extend_from_slice(block);
        self.units += 1;
    }

    /// Register number the segment is written to.
    pub fn register(&self, control_register_base: u16) -> u16 {
        control_register_base + CONTROL_REGISTERS_PER_UNIT * self.first_unit as u16
    }

    pub fn register_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Pack the write-back blocks of all present units into write segments.
///
/// A segment ends at an absent slot (writes must be contiguous) and after
/// [`MAX_SEGMENT_UNITS`] air conditioners (the write ceiling). A ventilation
/// unit contributes only its first register and always stands alone.
/// Units whose status has never been read are treated as absent.
pub fn pack_segments(units: &UnitTable) -> Vec<RegisterSegment> {
    let mut segments = Vec::new();
    let mut current: Option<RegisterSegment> = None;

    for (index, slot) in units.iter().enumerate() {
        let Some((unit, block)) = slot.as_ref().and_then(|unit| unit.write_back().map(|block| (unit, block))) else {
            segments.extend(current.take());
            continue;
        };

        match unit.kind() {
            UnitKind::HeatReclaimVentilation => {
                segments.extend(current.take());

                let mut segment = RegisterSegment::new(index);
                segment.push(block);
                segments.push(segment);
            },
            UnitKind::AirConditioner => {
                let segment = current.get_or_insert_with(|| RegisterSegment::new(index));
                segment.push(block);

                if segment.units == MAX_SEGMENT_UNITS {
                    segments.extend(current.take());
                }
            }
        }
    }

    segments.extend(current.take());

    segments
}


enum EngineRequest {
    Discover(oneshot::Sender<Result<()>>),
    Sync(oneshot::Sender<Result<()>>),
    Write {
        unit: u8,
        offset: usize,
        value: [u8; 2],
        outcome: oneshot::Sender<Result<()>>
    },
}


pub struct Engine {
    client: Client,
    config: EngineConfig,
    units: UnitTable,
    initialized: bool,
    on_status: Option<StatusCallback>,
    snapshot: watch::Sender<UnitTable>,
    last_sync: Option<(Instant, Result<()>)>,
}

impl Engine {
    pub fn new(client: Client, config: EngineConfig) -> Self {
        let (snapshot, _) = watch::channel(Default::default());

        Self {
            client,
            config,
            units: Default::default(),
            initialized: false,
            on_status: None,
            snapshot,
            last_sync: None
        }
    }

    /// Set the callback receiving every present unit's status block after each refresh.
    pub fn on_status<F>(&mut self, callback: F) where
        F: FnMut(&Unit, &StatusBlock) + Send + Sync + 'static
    {
        self.on_status = Some(Box::new(callback));
    }

    pub fn units(&self) -> &UnitTable {
        &self.units
    }

    pub fn unit(&self, index: u8) -> Option<&Unit> {
        self.units.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn subscribe(&self) -> watch::Receiver<UnitTable> {
        self.snapshot.subscribe()
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.units.clone());
    }

    async fn read_register(&self, register: u16) -> Result<u16> {
        let data = self.client.read_input_registers(self.config.slave, register, 1).await?;

        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Find out which units are connected and what they can do.
    pub async fn discover(&mut self) -> Result<()> {
        let adaptor_status = self.read_register(ADAPTOR_STATUS).await?;
        if adaptor_status & ADAPTOR_READY == 0 {
            return Err(BusError::AdaptorNotReady)
        }

        let connected = self.read_register(CONNECTION_STATUS).await?;
        debug!("connection status: {connected:016b}");

        // 8 units per page; the second page only if a unit 8-15 is connected
        let pages = if connected & 0xff00 != 0 { 2 } else { 1 };
        let page_registers = CAPABILITY_UNITS_PER_PAGE as u16 * CAPABILITY_REGISTERS_PER_UNIT;

        let mut capabilities = BytesMut::with_capacity(pages * page_registers as usize * 2);
        for page in 0..pages as u16 {
            let register = CAPABILITY_FIRST + page * page_registers;
            let data = self.client.read_input_registers(self.config.slave, register, page_registers).await?;
            capabilities.extend_from_slice(&data);
        }

        let block_len = CAPABILITY_REGISTERS_PER_UNIT as usize * 2;

        for index in 0..UNIT_COUNT {
            if connected & (1 << index) == 0 {
                if self.units[index].take().is_some() {
                    info!("unit {index} disconnected");
                }
                continue;
            }

            let start = index * block_len;
            let block: CapabilityBlock = capabilities.get(start..start + block_len)
                .and_then(|block| CapabilityBlock::try_from(block).ok())
                .ok_or_else(|| BusError::ProtocolViolation(format!("no capability registers for unit {index}")))?;

            let mut unit = Unit::new(index as u8, block);

            // keep the last known registers of a unit that is still the same
            if let Some(previous) = &self.units[index] {
                if previous.capability_block() == &block {
                    if let Some(status) = previous.status() {
                        unit.set_status(*status);
                    }
                }
            }

            info!("unit {index}: {} {:?}", unit.kind(), unit.capabilities());

            self.units[index] = Some(unit);
        }

        self.publish();

        Ok(())
    }

    /// Read the status of every unit, hand it to the status callback, and write
    /// the control registers back in packed segments.
    pub async fn refresh_all_registers(&mut self) -> Result<()> {
        debug!("refresh started");

        self.read_all_status().await?;
        let segments = self.write_back().await?;

        debug!("refresh finished ({segments} write segments)");

        Ok(())
    }

    /// Read the status block of every present unit and pass each to the status callback.
    pub async fn read_all_status(&mut self) -> Result<()> {
        let mut status = BytesMut::with_capacity(STATUS_PAGES as usize * MAX_READ_REGISTERS as usize * 2);
        for page in 0..STATUS_PAGES {
            let register = STATUS_FIRST + page * MAX_READ_REGISTERS;
            let data = self.client.read_input_registers(self.config.slave, register, MAX_READ_REGISTERS).await?;
            status.extend_from_slice(&data);
        }

        let block_len = STATUS_REGISTERS_PER_UNIT as usize * 2;

        for (index, slot) in self.units.iter_mut().enumerate() {
            let Some(unit) = slot else { continue };

            let start = index * block_len;
            let block: StatusBlock = status.get(start..start + block_len)
                .and_then(|block| StatusBlock::try_from(block).ok())
                .ok_or_else(|| BusError::ProtocolViolation(format!("no status registers for unit {index}")))?;

            unit.set_status(block);

            if let Some(callback) = self.on_status.as_mut() {
                callback(unit, &block);
            }
        }

        self.publish();

        Ok(())
    }

    /// Write every unit's register block back to its control registers, one
    /// transaction per segment. Returns the number of segments written.
    pub async fn write_back(&self) -> Result<usize> {
        let segments = pack_segments(&self.units);

        for segment in &segments {
            let register = segment.register(self.config.control_register_base);
            debug!("writing units {}..{} at {register}", segment.first_unit, segment.first_unit as usize + segment.units);

            self.client.send_preset_multiple_register_command(self.config.slave, register, &segment.data).await?;
        }

        Ok(segments.len())
    }

    /// Run discovery followed by a first refresh.
    ///
    /// Only a discovery failure leaves the engine uninitialized.
    pub async fn initialize(&mut self) -> Result<()> {
        if let Err(err) = self.discover().await {
            self.initialized = false;
            warn!("system initialization failed: {err}");
            return Err(err)
        }

        self.initialized = true;
        info!("system initialization finished");

        self.last_sync = None;
        // failures are logged by sync and retried by the refresh timer
        let _ = self.sync().await;

        Ok(())
    }

    /// Refresh, unless the previous sync finished within the debounce window,
    /// in which case its result is returned again.
    pub async fn sync(&mut self) -> Result<()> {
        if let Some((at, outcome)) = &self.last_sync {
            if at.elapsed() < self.config.sync_debounce {
                debug!("sync debounced");
                return outcome.clone()
            }
        }

        let outcome = self.refresh_all_registers().await;

        if let Err(err) = &outcome {
            warn!("sync error: {err}");
        }

        self.last_sync = Some((Instant::now(), outcome.clone()));

        outcome
    }

    /// Write one control register of a unit (`offset` 0 to 2).
    ///
    /// The unit's register block is patched too, so the next refresh writes the
    /// same value back.
    pub async fn write(&mut self, index: u8, offset: usize, value: [u8; 2]) -> Result<()> {
        let unit = self.units.get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(BusError::UnitNotPresent(index))?;

        let writable = unit.kind().writable_registers();
        if offset >= writable {
            return Err(BusError::InvalidRequest(format!(
                "unit {index} ({}) has {writable} writable registers, not {}", unit.kind(), offset + 1
            )))
        }

        unit.set_register(offset, value);

        let register = self.config.control_register_base + CONTROL_REGISTERS_PER_UNIT * index as u16 + offset as u16;
        self.client.send_preset_single_register_command(self.config.slave, register, value).await?;

        self.publish();

        Ok(())
    }

    /// Run the health-check and refresh timers and serve requests from the returned handle.
    ///
    /// The task ends when every handle has been dropped.
    pub fn spawn(self) -> EngineHandle {
        let (requests_send, requests_recv) = mpsc::channel(16);

        let handle = EngineHandle {
            requests: requests_send,
            units: self.snapshot.subscribe(),
            client: self.client.clone()
        };

        tokio::spawn(self.run(requests_recv));

        handle
    }

    async fn run(mut self, mut requests: mpsc::Receiver<EngineRequest>) {
        let mut health_check = interval(self.config.discovery_interval);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut refresh = interval_at(Instant::now() + self.config.refresh_interval, self.config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = health_check.tick(), if !self.initialized => {
                    if self.initialize().await.is_ok() {
                        refresh.reset();
                    }
                },

                _ = refresh.tick(), if self.initialized => {
                    let _ = self.sync().await;
                },

                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break
                }
            }
        }

        debug!("engine stopped");
    }

    async fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Discover(outcome) => {
                let _ = outcome.send(self.initialize().await);
            },
            EngineRequest::Sync(outcome) => {
                let _ = outcome.send(self.sync().await);
            },
            EngineRequest::Write { unit, offset, value, outcome } => {
                let _ = outcome.send(self.write(unit, offset, value).await);
            }
        }
    }
}


/// Handle to a spawned [`Engine`], for the layer presenting units to users.
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<EngineRequest>,
    units: watch::Receiver<UnitTable>,
    client: Client,
}

impl EngineHandle {
    async fn request<F>(&self, request: F) -> Result<()> where
        F: FnOnce(oneshot::Sender<Result<()>>) -> EngineRequest
    {
        let (outcome_send, outcome_recv) = oneshot::channel();

        self.requests.send(request(outcome_send)).await
            .map_err(|_| BusError::Closed)?;

        outcome_recv.await.map_err(|_| BusError::Closed)?
    }

    /// Latest known state of a unit, without bus traffic. `None` if absent.
    pub fn read(&self, unit: u8) -> Option<Unit> {
        self.units.borrow().get(unit as usize).cloned().flatten()
    }

    pub fn units(&self) -> UnitTable {
        self.units.borrow().clone()
    }

    /// A receiver notified whenever the unit table changes.
    pub fn subscribe(&self) -> watch::Receiver<UnitTable> {
        self.units.clone()
    }

    pub async fn write(&self, unit: u8, offset: usize, value: [u8; 2]) -> Result<()> {
        self.request(|outcome| EngineRequest::Write { unit, offset, value, outcome }).await
    }

    /// Debounced refresh.
    pub async fn sync(&self) -> Result<()> {
        self.request(EngineRequest::Sync).await
    }

    /// Re-run discovery now.
    pub async fn discover(&self) -> Result<()> {
        self.request(EngineRequest::Discover).await
    }

    /// The command sequencer, for raw register access.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

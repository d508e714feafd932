pub mod scheduler;

use log::{debug, error, info, warn};
use std::time::Instant;
use thiserror::Error;

use crate::config::ParameterConfig;
use crate::metering_62056::structs::MeterIdentity;
use crate::metering_62056::{utils, MeterError, MeterTransport};
use crate::mqtt::{BusError, MessageBus};
use crate::sensors::publisher::{EntityPublisher, PublishError};
use crate::sensors::tracker::PublicationTracker;
use crate::sensors::{derive, pseudo};

const IDENTIFICATION_ADDRESS: &str = "HELLO";

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Meter(#[from] MeterError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl CycleError {
    pub fn is_timeout(&self) -> bool {
        match self {
            CycleError::Meter(e) => e.is_timeout(),
            CycleError::Bus(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Connected,
    Authenticated,
    Identified,
    Publishing,
    Closing,
    Failed,
}

/// Reads the meter and publishes its entities, one cycle at a time. The
/// bus connection and the discovery tracker live across cycles.
pub struct CycleManager<T: MeterTransport, B: MessageBus> {
    transport: T,
    bus: B,
    tracker: PublicationTracker,
    discovery_prefix: String,
    /* Kept from the last successful identification */
    identity: Option<MeterIdentity>,
    state: CycleState,
}

impl<T: MeterTransport, B: MessageBus> CycleManager<T, B> {
    pub fn new(transport: T, bus: B, discovery_prefix: &str) -> Self {
        return CycleManager {
            transport,
            bus,
            tracker: PublicationTracker::new(),
            discovery_prefix: discovery_prefix.to_string(),
            identity: None,
            state: CycleState::Idle,
        };
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn identity(&self) -> Option<&MeterIdentity> {
        self.identity.as_ref()
    }

    /// Forgets every discovery payload sent so far, they all go out again
    /// on the next cycle.
    pub fn reset_publications(&mut self) {
        self.tracker.reset();
    }

    /// Runs one cycle over already interpolated parameters.
    pub async fn run_cycle(&mut self, parameters: &[ParameterConfig]) -> Result<(), CycleError> {
        let started = Instant::now();
        self.state = CycleState::Idle;

        let result = self.session(parameters).await;

        self.state = CycleState::Closing;
        if let Err(e) = self.transport.disconnect() {
            debug!("Ignoring error closing meter connection: {e}");
        }

        match result {
            Ok(()) => {
                self.state = CycleState::Idle;
                if let Err(e) = self.set_online(true, false).await {
                    error!("Unable to publish meter online status: {e}");
                }
                self.publish_cycle_duration(started).await;
                info!("Cycle completed in {:?}", started.elapsed());
                Ok(())
            },
            Err(e) => {
                self.state = CycleState::Failed;
                if e.is_timeout() {
                    if let Err(pe) = self.set_online(false, false).await {
                        warn!("Unable to publish meter offline status: {pe}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn session(&mut self, parameters: &[ParameterConfig]) -> Result<(), CycleError> {
        self.transport.connect()?;
        self.state = CycleState::Connected;

        self.transport.authenticate()?;
        self.state = CycleState::Authenticated;

        let hello = self.transport.read_values(IDENTIFICATION_ADDRESS, None)?;
        let identity = utils::parse_meter_identity(&hello)?;
        info!("Meter identified as model {}, SW version {}, serial number {}",
              identity.model, identity.sw_version, identity.serial_number);
        self.identity = Some(identity.clone());
        self.state = CycleState::Identified;

        /* Last will has to be in place before the bus connects */
        if let Err(e) = self.set_online(false, true).await {
            error!("Unable to register last will for meter online status: {e}");
        }
        self.bus.connect().await?;
        self.state = CycleState::Publishing;

        for param in parameters {
            debug!("Reading parameter '{}' with additional data {:?}", param.address, param.additional_data);
            let reading = match self.transport.read_values(&param.address, param.additional_data.as_deref()) {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(e.into()),
                Err(e) => {
                    error!("Got error reading parameter at address {}, skipping to next. Parameter: {:?}. Error: {}",
                           param.address, param, e);
                    continue;
                }
            };

            let views = derive(param, &reading, &identity, &self.discovery_prefix);
            EntityPublisher::new(&mut self.bus, &mut self.tracker).publish_all(&views, false).await;
        }

        self.state = CycleState::Closing;
        if let Err(e) = self.transport.end_session() {
            debug!("Ignoring error ending meter session: {e}");
        }
        Ok(())
    }

    async fn set_online(&mut self, online: bool, setup_only: bool) -> Result<(), PublishError> {
        let Some(identity) = &self.identity else {
            debug!("Meter has not been identified yet, no online status to report");
            return Ok(());
        };
        let Some(view) = pseudo::online_entity(identity, &self.discovery_prefix, online) else {
            return Ok(());
        };
        EntityPublisher::new(&mut self.bus, &mut self.tracker).publish(&view, setup_only).await
    }

    async fn publish_cycle_duration(&mut self, started: Instant) {
        let Some(identity) = &self.identity else {
            return;
        };
        if let Some(view) = pseudo::cycle_duration_entity(identity, &self.discovery_prefix, started.elapsed()) {
            EntityPublisher::new(&mut self.bus, &mut self.tracker).publish_all(&[view], false).await;
        }
    }

    /// Reports the meter offline and closes the bus connection. Called once
    /// on shutdown, errors are only logged.
    pub async fn finalize(&mut self) {
        /* A cycle cancelled mid-way leaves the meter in programming mode */
        if matches!(self.state, CycleState::Connected | CycleState::Authenticated
                                | CycleState::Identified | CycleState::Publishing) {
            info!("Closing interrupted meter session");
            if let Err(e) = self.transport.end_session() {
                debug!("Ignoring error ending meter session on shutdown: {e}");
            }
            if let Err(e) = self.transport.disconnect() {
                debug!("Ignoring error closing meter connection on shutdown: {e}");
            }
            self.state = CycleState::Idle;
        }
        if let Err(e) = self.set_online(false, false).await {
            debug!("Ignoring error publishing offline status on shutdown: {e}");
        }
        if let Err(e) = self.bus.disconnect().await {
            debug!("Ignoring error disconnecting from MQTT on shutdown: {e}");
        }
    }
}

//! Application orchestration for the setu-gw daemon
//!
//! Owns every long-lived component, wires them together at startup, and
//! sequences the graceful shutdown: signal -> shutdown flag -> accept loop
//! drains the connection registry -> collector and reader threads exit.

use crate::collector::events::EventSignal;
use crate::collector::Collector;
use crate::config::Config;
use crate::display::LogDisplay;
use crate::error::{Error, Result};
use crate::gateway::{Broadcaster, ConnectionRegistry, GatewayServer, HandlerCtx};
use crate::mac::{MacEvent, MacLink, SerialMacLink};
use crate::nv::{DeviceStore, MemNvStore};
use crate::oad::OadCoordinator;
use crossbeam_channel::{unbounded, Receiver};
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between statistics log lines
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Main application structure that manages all components
pub struct GatewayApp {
    config: Config,
    collector: Arc<Collector>,
    ctx: Arc<HandlerCtx>,
    mac_events: Option<Receiver<MacEvent>>,
    shutdown: Arc<AtomicBool>,
}

impl GatewayApp {
    /// Create a new application instance: open the co-processor link and
    /// build the collector, OAD engine and gateway server around it.
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing setu-gw application");

        let shutdown = Arc::new(AtomicBool::new(false));
        let (mac_tx, mac_rx) = unbounded();

        info!("Opening MAC co-processor on {}", config.mac.port);
        let mac: Arc<dyn MacLink> = Arc::new(SerialMacLink::open(
            &config.mac.port,
            config.mac.baud_rate,
            mac_tx,
            Arc::clone(&shutdown),
        )?);

        let nv = Arc::new(MemNvStore::new());
        let store = Arc::new(DeviceStore::new(nv, config.collector.max_devices));
        let display: Arc<dyn crate::display::DisplaySink> = Arc::new(LogDisplay);

        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let sink: Arc<dyn crate::collector::IndicationSink> = broadcaster.clone();

        let signal = Arc::new(EventSignal::new());
        let collector = Collector::new(
            &config,
            mac,
            Arc::clone(&store),
            Arc::clone(&display),
            sink,
            Arc::clone(&signal),
        );

        let oad = OadCoordinator::new(config.oad.clone(), display, signal);
        collector.attach_oad(Arc::clone(&oad));
        oad.attach_collector(&collector);

        let ctx = Arc::new(HandlerCtx {
            collector: Arc::clone(&collector),
            oad,
            store,
            broadcaster,
            registry,
        });

        info!("Components initialized");

        Ok(Self {
            config,
            collector,
            ctx,
            mac_events: Some(mac_rx),
            shutdown,
        })
    }

    /// Start all background threads and run the main loop until a shutdown
    /// signal arrives.
    pub fn run(&mut self) -> Result<()> {
        let collector_handle = self.start_collector_thread()?;
        let server_handle = self.start_server_thread()?;
        self.setup_signal_handler();

        info!(
            "setu-gw running, gateway clients on {}",
            self.config.network.bind_address
        );

        let mut last_stats = Instant::now();
        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.log_statistics();
                last_stats = Instant::now();
            }
        }

        info!("Shutdown signal received, stopping threads");
        let _ = server_handle.join();
        let _ = collector_handle.join();

        info!("setu-gw stopped");
        Ok(())
    }

    fn start_collector_thread(&mut self) -> Result<JoinHandle<()>> {
        let events = self
            .mac_events
            .take()
            .ok_or_else(|| Error::Other("application already running".into()))?;
        let collector = Arc::clone(&self.collector);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || collector.run(&events, &shutdown))?;
        Ok(handle)
    }

    fn start_server_thread(&self) -> Result<JoinHandle<()>> {
        let server = GatewayServer::new(
            self.config.network.clone(),
            Arc::clone(&self.ctx),
            Arc::clone(&self.shutdown),
        );
        let shutdown = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new()
            .name("gw-accept".to_string())
            .spawn(move || {
                if let Err(e) = server.run() {
                    // Failing to bind the client socket takes the daemon down
                    error!("Gateway server failed: {}", e);
                    shutdown.store(true, Ordering::Relaxed);
                }
            })?;
        Ok(handle)
    }

    /// Setup signal handler for graceful shutdown
    fn setup_signal_handler(&self) {
        let shutdown = Arc::clone(&self.shutdown);

        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                let mut signals =
                    Signals::new([SIGINT, SIGTERM]).expect("Failed to register signal handlers");

                if let Some(sig) = signals.forever().next() {
                    info!("Received signal {:?}, initiating shutdown", sig);
                    shutdown.store(true, Ordering::Relaxed);
                }
            })
            .expect("Failed to spawn signal handler thread");
    }

    fn log_statistics(&self) {
        let stats = self.collector.statistics();
        info!(
            "Stats: config {}/{}, tracking {}/{}, sensor msgs {}, clients {}",
            stats.config_responses,
            stats.config_requests_sent,
            stats.tracking_responses,
            stats.tracking_requests_sent,
            stats.sensor_messages,
            self.ctx.registry.len()
        );

        let failures = stats.channel_access_failures
            + stats.ack_failures
            + stats.tx_transaction_expired
            + stats.tx_transaction_overflow
            + stats.other_tx_failures;
        if failures > 0 {
            info!(
                "Tx failures: channel access {}, no-ack {}, expired {}, overflow {}",
                stats.channel_access_failures,
                stats.ack_failures,
                stats.tx_transaction_expired,
                stats.tx_transaction_overflow
            );
        }
    }
}

//! The device wait loop: accepts phones over usb or tcp, runs one session
//! at a time and goes back to waiting when it ends.

use crate::config::HeadUnitConfiguration;
use crate::session;
use crate::transport::{TcpTransport, Transport};
use crate::{HeadUnitTrait, LinkError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Errors that end the application
#[derive(Debug)]
pub enum AppError {
    /// The device layer could not be brought up
    DeviceLayerInit(String),
    /// The bluetooth bootstrap service could not be registered
    BluetoothRegistration(String),
}

impl AppError {
    /// The process exit code for this error, a clean exit is zero
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::DeviceLayerInit(_) => 1,
            AppError::BluetoothRegistration(_) => 2,
        }
    }
}

/// Wait for the next transport arriving over usb. Aborted and in-progress
/// conditions park the wait, anything else restarts it.
#[cfg(feature = "usb")]
async fn next_usb_transport(hub: &crate::usb::AoapHub) -> Arc<dyn Transport> {
    loop {
        match hub.wait_for_accessory().await {
            Ok(endpoints) => {
                return Arc::new(crate::transport::UsbTransport::new(endpoints));
            }
            Err(crate::usb::UsbError::Aborted) | Err(crate::usb::UsbError::InProgress) => {
                std::future::pending::<()>().await;
            }
            Err(e) => {
                log::error!("Usb hub failed, restarting the wait: {:?}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// The usb wait when the crate is built without usb support
#[cfg(not(feature = "usb"))]
async fn next_usb_transport() -> Arc<dyn Transport> {
    std::future::pending().await
}

/// The application core. Owns the listeners and at most one session.
pub struct App {
    /// Cancelled when the user asks the application to stop
    stop: CancellationToken,
}

impl App {
    /// construct a new self
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
        }
    }

    /// Ask the wait loop to exit. The active session, if any, is torn down.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Bind the projection listener and run the wait loop until stopped.
    pub async fn run<T: HeadUnitTrait + ?Sized + 'static>(
        &self,
        config: HeadUnitConfiguration,
        main: Arc<T>,
    ) -> Result<(), AppError> {
        let port = config.settings.wifi.port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| AppError::DeviceLayerInit(format!("tcp listen failed: {}", e)))?;
        log::info!("Waiting for wireless projection on port {}", port);
        self.run_with_listener(listener, config, main).await
    }

    /// Run the wait loop on an already bound listener. Useful when the
    /// embedder manages its own sockets.
    pub async fn run_with_listener<T: HeadUnitTrait + ?Sized + 'static>(
        &self,
        listener: tokio::net::TcpListener,
        config: HeadUnitConfiguration,
        main: Arc<T>,
    ) -> Result<(), AppError> {
        #[cfg(feature = "wireless")]
        self.start_bootstrap(&config, main.as_ref()).await?;
        #[cfg(feature = "usb")]
        let hub = crate::usb::AoapHub::new();

        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<Result<(), LinkError>>(1);
        let mut active: Option<CancellationToken> = None;
        loop {
            #[cfg(feature = "usb")]
            let usb = next_usb_transport(&hub);
            #[cfg(not(feature = "usb"))]
            let usb = next_usb_transport();

            tokio::select! {
                _ = self.stop.cancelled() => {
                    #[cfg(feature = "usb")]
                    hub.stop();
                    if let Some(token) = active.take() {
                        token.cancel();
                        let _ = done_rx.recv().await;
                    }
                    return Ok(());
                }
                done = done_rx.recv() => {
                    match done {
                        Some(Ok(())) => log::info!("Session ended cleanly"),
                        Some(Err(e)) => log::error!("Session ended: {:?}", e),
                        None => {}
                    }
                    active = None;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if active.is_some() {
                                log::warn!("Refusing {}, a session is already active", addr);
                                drop(stream);
                            } else {
                                log::info!("Got wireless client: {:?}", addr);
                                let transport: Arc<dyn Transport> =
                                    Arc::new(TcpTransport::from_tcp(stream));
                                active = Some(self.spawn_session(transport, &config, &main, &done_tx));
                            }
                        }
                        Err(e) => log::error!("Accept failed: {}", e),
                    }
                }
                transport = usb => {
                    if active.is_some() {
                        log::warn!("Refusing usb device, a session is already active");
                        transport.stop();
                    } else {
                        log::info!("Got usb accessory client");
                        active = Some(self.spawn_session(transport, &config, &main, &done_tx));
                    }
                }
            }
        }
    }

    /// Start one session over the given transport, reporting its end on the
    /// completion queue.
    fn spawn_session<T: HeadUnitTrait + ?Sized + 'static>(
        &self,
        transport: Arc<dyn Transport>,
        config: &HeadUnitConfiguration,
        main: &Arc<T>,
        done: &tokio::sync::mpsc::Sender<Result<(), LinkError>>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let session = session::run_session(transport, config.clone(), main.clone(), token.clone());
        let done = done.clone();
        tokio::spawn(async move {
            let r = session.await;
            let _ = done.send(r).await;
        });
        token
    }

    /// Register the bluetooth bootstrap service and keep the last paired
    /// phone persisted for auto reconnect.
    #[cfg(feature = "wireless")]
    async fn start_bootstrap<T: HeadUnitTrait + ?Sized>(
        &self,
        config: &HeadUnitConfiguration,
        main: &T,
    ) -> Result<(), AppError> {
        let Some(wireless) = main.supports_wireless() else {
            return Ok(());
        };
        let settings = crate::btservice::profile_settings();
        let profile = wireless
            .setup_bluetooth_profile(&settings)
            .await
            .map_err(AppError::BluetoothRegistration)?;
        let (paired_tx, mut paired_rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            let e = crate::btservice::bootstrap_service(profile, wireless, paired_tx).await;
            log::error!("Bootstrap service stopped: {:?}", e);
        });
        let mut persisted = config.settings.clone();
        let path = config.settings_path.clone();
        tokio::spawn(async move {
            while let Some(addr) = paired_rx.recv().await {
                persisted.last_bluetooth_pair = Some(addr);
                if let Some(path) = &path {
                    if let Err(e) = persisted.save(path) {
                        log::error!("Failed to persist the paired phone: {}", e);
                    }
                }
            }
        });
        Ok(())
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

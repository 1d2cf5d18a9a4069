//! Device facade
//!
//! Ties the session manager to the audio path and the UI. The manager owns
//! the call state; the device only reacts to the events it accepts.

use super::notifier::CallNotifier;
use super::snapshot::DeviceSnapshot;
use crate::config::{PreferenceStore, Preferences};
use crate::domain::profile::SipProfile;
use crate::domain::session::{CallDirection, SessionState, SipEvent, SipEventKind};
use crate::infrastructure::media::AudioResource;
use crate::infrastructure::protocols::sip::{IncomingMessage, SipError, SipSessionManager, Transport};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Applies accepted session events to the audio path and the UI
#[derive(Clone)]
struct EventHandler {
    audio: Arc<dyn AudioResource>,
    notifier: Arc<dyn CallNotifier>,
    manager: Arc<SipSessionManager>,
}

impl EventHandler {
    async fn handle(&self, event: SipEvent) {
        debug!("Handling {} from {}", event.kind.name(), event.from);

        match event.kind {
            SipEventKind::LocalRinging => {
                self.notifier.incoming_call(&event.from).await;
            }
            SipEventKind::CallConnected => {
                match (event.remote_rtp_port, self.remote_ip(&event).await) {
                    (Some(port), Some(ip)) => {
                        if let Err(e) = self.audio.setup_audio(port, ip).await {
                            error!("Failed to start audio towards {}:{}: {}", ip, port, e);
                        }
                    }
                    _ => warn!("Call connected without a usable remote RTP endpoint"),
                }
                self.notifier.call_connected(&event.from).await;
            }
            kind if kind.is_terminal() => {
                self.audio.release_audio_resources().await;
                self.notifier.call_ended(kind, &event.from).await;
            }
            SipEventKind::Message => {
                self.notifier.message_received(&event.from, &event.content).await;
            }
            SipEventKind::MessageFailed => {
                self.notifier.message_failed(&event.from, event.status).await;
            }
            SipEventKind::Registered => self.notifier.registration_changed(true).await,
            SipEventKind::RegistrationFailed => self.notifier.registration_changed(false).await,
            _ => {}
        }
    }

    /// The event's address, or the registrar when the answer carried none
    async fn remote_ip(&self, event: &SipEvent) -> Option<IpAddr> {
        if let Some(ip) = event.remote_ip {
            return Some(ip);
        }

        let profile = self.manager.profile().await?;
        if let Ok(ip) = profile.remote_ip().parse() {
            return Some(ip);
        }
        tokio::net::lookup_host(profile.remote_host_port())
            .await
            .ok()?
            .next()
            .map(|addr| addr.ip())
    }
}

pub struct Device {
    handler: EventHandler,
    events: Mutex<Option<mpsc::UnboundedReceiver<SipEvent>>>,
    incoming: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl Device {
    pub fn new(audio: Arc<dyn AudioResource>, notifier: Arc<dyn CallNotifier>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handler: EventHandler {
                audio,
                notifier,
                manager: Arc::new(SipSessionManager::new(tx)),
            },
            events: Mutex::new(Some(rx)),
            incoming: Mutex::new(None),
            transport: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Start the transport and bind the session manager. Only the first call
    /// has any effect.
    pub async fn initialize(
        &self,
        profile: SipProfile,
        custom_headers: HashMap<String, String>,
        mut transport: Box<dyn Transport>,
    ) -> Result<(), SipError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Device already initialized");
            return Ok(());
        }

        let result: Result<(), SipError> = async {
            transport.start().await?;
            let incoming = transport.take_receiver();
            let transport: Arc<dyn Transport> = Arc::from(transport);

            self.handler
                .manager
                .bind(profile, transport.clone(), custom_headers)
                .await?;

            *self.incoming.lock().await = incoming;
            *self.transport.lock().await = Some(transport);
            Ok(())
        }
        .await;

        match &result {
            Ok(()) => info!("Device initialized"),
            Err(e) => {
                error!("Device initialization failed: {}", e);
                self.initialized.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn sip_manager(&self) -> Arc<SipSessionManager> {
        self.handler.manager.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.handler.manager.state().await
    }

    pub async fn register(&self) -> Result<(), SipError> {
        self.handler.manager.register().await.map_err(|e| {
            error!("Register failed: {}", e);
            e
        })
    }

    pub async fn unregister(&self) -> Result<(), SipError> {
        self.handler.manager.unregister().await.map_err(|e| {
            error!("Unregister failed: {}", e);
            e
        })
    }

    /// Prepare the local audio endpoint and place a call to `to`
    pub async fn call(&self, to: &str) -> Result<(), SipError> {
        let state = self.handler.manager.state().await;
        if !state.accepts_new_call() {
            return Err(SipError::InvalidState(format!(
                "cannot place a call while {}",
                state.name()
            )));
        }
        let port = self.prepare_audio().await?;

        if let Err(e) = self.handler.manager.call(to, port).await {
            error!("Call to {} failed: {}", to, e);
            self.handler.audio.release_audio_resources().await;
            return Err(e);
        }
        Ok(())
    }

    /// Answer the ringing inbound call
    pub async fn accept_call(&self) -> Result<(), SipError> {
        if self.handler.manager.state().await != SessionState::Ringing
            || self.handler.manager.call_direction().await != Some(CallDirection::Inbound)
        {
            return Err(SipError::InvalidState(
                "no inbound call waiting for an answer".to_string(),
            ));
        }
        let port = self.prepare_audio().await?;

        if let Err(e) = self.handler.manager.accept_call(port).await {
            error!("Accept failed: {}", e);
            self.handler.audio.release_audio_resources().await;
            return Err(e);
        }
        Ok(())
    }

    async fn prepare_audio(&self) -> Result<u16, SipError> {
        let profile = self.handler.manager.profile().await.ok_or(SipError::NotInitialized)?;
        let local_ip = profile.local_ip_addr()?;

        let port = self.handler.audio.setup_audio_stream(local_ip).await.map_err(|e| {
            error!("Failed to prepare audio on {}: {}", local_ip, e);
            SipError::from(e)
        })?;
        debug!("Local RTP port {}", port);
        Ok(port)
    }

    pub async fn reject_call(&self) -> Result<(), SipError> {
        self.handler.manager.reject_call().await.map_err(|e| {
            error!("Reject failed: {}", e);
            e
        })
    }

    /// Hang up whatever call is in progress and free the audio path
    pub async fn hangup(&self) -> Result<(), SipError> {
        let in_call = self.handler.manager.state().await.is_in_call();
        let result = self.handler.manager.hangup().await;
        if in_call {
            self.handler.audio.release_audio_resources().await;
        }
        result.map_err(|e| {
            error!("Hangup failed: {}", e);
            e
        })
    }

    pub async fn send_message(&self, to: &str, text: &str) -> Result<(), SipError> {
        self.handler.manager.send_message(to, text).await.map_err(|e| {
            error!("Message to {} failed: {}", to, e);
            e
        })
    }

    pub async fn send_dtmf(&self, digit: &str) -> Result<(), SipError> {
        self.handler.manager.send_dtmf(digit).await.map_err(|e| {
            error!("DTMF failed: {}", e);
            e
        })
    }

    /// React to one event
    pub async fn handle_event(&self, event: SipEvent) {
        self.handler.handle(event).await;
    }

    /// Handle every queued event. Returns how many were handled; always 0
    /// once `run` owns the queue.
    pub async fn drain_events(&self) -> usize {
        let mut events = self.events.lock().await;
        let Some(rx) = events.as_mut() else {
            return 0;
        };

        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handler.handle(event).await;
            handled += 1;
        }
        handled
    }

    /// Spawn the transport receive loop and the event loop
    pub async fn run(&self) -> Result<(), SipError> {
        if !self.is_initialized() {
            return Err(SipError::NotInitialized);
        }

        let mut tasks = self.tasks.lock().await;

        if let Some(mut incoming) = self.incoming.lock().await.take() {
            let manager = self.handler.manager.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(message) = incoming.recv().await {
                    if let Err(e) = manager.handle_incoming(message).await {
                        warn!("Failed to handle message: {}", e);
                    }
                }
                debug!("Receive loop finished");
            }));
        }

        if let Some(mut events) = self.events.lock().await.take() {
            let handler = self.handler.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    handler.handle(event).await;
                }
                debug!("Event loop finished");
            }));
        }

        info!("Device running");
        Ok(())
    }

    /// Re-apply persisted settings to the profile
    pub async fn update_preferences(&self, prefs: &Preferences) -> Result<(), SipError> {
        let mut profile = self
            .handler
            .manager
            .profile()
            .await
            .ok_or(SipError::NotInitialized)?;
        profile.apply_preferences(prefs);
        self.handler.manager.set_profile(profile).await
    }

    /// Follow a preference store: every change re-applies the whole set
    pub async fn watch_preferences(&self, store: PreferenceStore) {
        let manager = self.handler.manager.clone();
        let mut changes = store.subscribe();

        self.tasks.lock().await.push(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => debug!("Preference {} changed", change.key),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Skipped {} preference changes", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                let prefs = store.snapshot().await;
                if let Some(mut profile) = manager.profile().await {
                    profile.apply_preferences(&prefs);
                    if let Err(e) = manager.set_profile(profile).await {
                        warn!("Failed to apply preferences: {}", e);
                    }
                }
            }
        }));
    }

    pub async fn snapshot(&self) -> Result<DeviceSnapshot, SipError> {
        let manager = &self.handler.manager;
        let profile = manager.profile().await.ok_or(SipError::NotInitialized)?;

        Ok(DeviceSnapshot::new(
            profile,
            manager.state().await,
            manager.is_registered().await,
            manager.custom_headers().await,
        ))
    }

    /// Restore profile, headers and registration flag. The device must be
    /// initialized; a stored call is never resumed.
    pub async fn restore_snapshot(&self, snapshot: DeviceSnapshot) -> Result<(), SipError> {
        let manager = &self.handler.manager;
        manager.set_profile(snapshot.profile).await?;
        manager.set_custom_headers(snapshot.custom_headers).await?;
        manager.restore_registration(snapshot.registered).await;
        info!("Device state restored");
        Ok(())
    }

    /// Hang up, free the audio path and stop the background tasks
    pub async fn shutdown(&self) {
        if self.is_initialized() {
            if let Err(e) = self.handler.manager.hangup().await {
                warn!("Hangup during shutdown failed: {}", e);
            }
        }
        self.handler.audio.release_audio_resources().await;

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        if let Some(transport) = self.transport.lock().await.take() {
            if let Err(e) = transport.stop().await {
                warn!("Failed to stop transport: {}", e);
            }
        }
        info!("Device shut down");
    }
}

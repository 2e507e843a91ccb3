use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use skyrelay_rpc::{RpcError, SimConnector, SimSession, TcpConnector, Value};
use tracing::{debug, info, warn};

use crate::{codec, Camera, CameraFrame};

/// Anything that can hand the stream generator a finished frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn get_frame(&self) -> Option<CameraFrame>;
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoStatus {
    pub connected: bool,
    pub camera: Camera,
}

struct StreamerState<S> {
    camera: Camera,
    session: Option<Arc<Mutex<S>>>,
}

/// Pulls frames for the active camera from the simulator.
///
/// Every RPC and codec call runs on tokio's blocking pool. The session sits
/// behind its own mutex, so concurrent viewers share one connection with at
/// most one request in flight.
pub struct CameraSource<C: SimConnector = TcpConnector> {
    connector: Arc<C>,
    jpeg_quality: u8,
    connect_lock: tokio::sync::Mutex<()>,
    state: Mutex<StreamerState<C::Session>>,
    ordinal: AtomicU64,
}

impl<C: SimConnector> CameraSource<C> {
    pub fn new(connector: C, jpeg_quality: u8) -> Self {
        Self {
            connector: Arc::new(connector),
            jpeg_quality,
            connect_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(StreamerState { camera: Camera::FrontCenter, session: None }),
            ordinal: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, StreamerState<C::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state().session.is_some()
    }

    pub fn camera(&self) -> Camera {
        self.state().camera
    }

    pub fn status(&self) -> VideoStatus {
        let st = self.state();
        VideoStatus { connected: st.session.is_some(), camera: st.camera }
    }

    /// Idempotent. Concurrent callers queue on the connect lock, so only one
    /// attempt runs at a time and late arrivals see its outcome.
    pub async fn connect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return true;
        }

        let connector = Arc::clone(&self.connector);
        match tokio::task::spawn_blocking(move || open_session(connector.as_ref())).await {
            Ok(Ok(session)) => {
                self.state().session = Some(Arc::new(Mutex::new(session)));
                info!("video: connected to simulator RPC");
                true
            }
            Ok(Err(e)) => {
                warn!("video: could not connect to simulator: {}", e);
                info!("video: make sure the simulator is running with its RPC port reachable");
                false
            }
            Err(e) => {
                warn!("video: connect worker failed: {}", e);
                false
            }
        }
    }

    /// Returns false, without touching state, for names outside [`Camera::ALL`].
    pub fn switch_camera(&self, name: &str) -> bool {
        match name.parse::<Camera>() {
            Ok(camera) => {
                self.state().camera = camera;
                info!("video: switched to camera {}", camera);
                true
            }
            Err(_) => false,
        }
    }

    /// Fetches, labels and re-encodes one frame. Never reconnects; every
    /// failure is logged at debug and yields `None`.
    pub async fn get_frame(&self) -> Option<CameraFrame> {
        let (session, camera) = {
            let st = self.state();
            (st.session.clone()?, st.camera)
        };

        let worker_session = Arc::clone(&session);
        let fetched = tokio::task::spawn_blocking(move || {
            let mut s = worker_session.lock().unwrap_or_else(PoisonError::into_inner);
            s.call("simGetImage", vec![Value::from(camera.sim_index()), Value::from(0)])
        })
        .await;

        let payload = match fetched {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!("video: simGetImage failed: {}", e);
                if e.is_connection() {
                    self.drop_session(&session);
                }
                return None;
            }
            Err(e) => {
                debug!("video: frame worker failed: {}", e);
                return None;
            }
        };

        let Some(raw) = codec::payload_bytes(payload) else {
            debug!("video: empty or unrecognised image payload");
            return None;
        };

        let quality = self.jpeg_quality;
        let label = camera.overlay_label();
        match tokio::task::spawn_blocking(move || codec::relabel(&raw, &label, quality)).await {
            Ok(Ok(encoded)) => Some(CameraFrame {
                camera,
                encoded,
                ordinal: self.ordinal.fetch_add(1, Ordering::Relaxed) + 1,
            }),
            Ok(Err(e)) => {
                debug!("video: {}", e);
                None
            }
            Err(e) => {
                debug!("video: codec worker failed: {}", e);
                None
            }
        }
    }

    /// Forget `failed` unless a newer session already replaced it.
    fn drop_session(&self, failed: &Arc<Mutex<C::Session>>) {
        let mut st = self.state();
        if st.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, failed)) {
            st.session = None;
            warn!("video: simulator connection lost");
        }
    }
}

#[async_trait]
impl<C: SimConnector> FrameSource for CameraSource<C> {
    async fn get_frame(&self) -> Option<CameraFrame> {
        CameraSource::get_frame(self).await
    }
}

fn open_session<C: SimConnector>(connector: &C) -> Result<C::Session, RpcError> {
    let mut session = connector.connect()?;
    // Older simulator builds have no ping; only a dead socket is fatal here.
    match session.call("ping", vec![]) {
        Ok(_) => {}
        Err(e) if e.is_connection() => return Err(e),
        Err(e) => debug!("video: ping unsupported: {}", e),
    }
    Ok(session)
}

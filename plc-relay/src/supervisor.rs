use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context as _;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::api;
use crate::capture::CaptureSource;
use crate::config::Settings;
use crate::error::PipelineError;
use crate::pipeline::{CapturePipeline, PipelineHandle, PipelineSettings};

/// Owns everything a running relay process consists of: the capture thread,
/// the pipeline handle and the optional HTTP listener. Shutdown goes through
/// this value rather than through process-wide state.
pub struct Supervisor {
    pipeline: PipelineHandle,
    capture: Option<thread::JoinHandle<Result<(), PipelineError>>>,
    http: Option<HttpListener>,
}

struct HttpListener {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl HttpListener {
    async fn bind(port: u16, state: Arc<api::AppState>, settings: &Settings) -> anyhow::Result<Self> {
        let app = api::router(state, &settings.allowed_ips);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind health check port {port}"))?;
        let addr = listener.local_addr()?;

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        });

        tracing::info!("Health check server started on http://{}", addr);
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(Ok(())) => tracing::info!("Health check server stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Health check server failed"),
            Err(e) => tracing::error!(error = %e, "Health check server task panicked"),
        }
    }
}

impl Supervisor {
    /// Start the HTTP listener (if enabled) and the capture thread.
    pub async fn launch<S>(settings: &Settings, source: S) -> anyhow::Result<Self>
    where
        S: CaptureSource + Send + 'static,
    {
        let mut pipeline = CapturePipeline::new(PipelineSettings::from(settings));
        let handle = pipeline.handle();

        let http = match settings.health_check_port {
            Some(port) => {
                let state = Arc::new(api::AppState {
                    pipeline: handle.clone(),
                    start_time: Instant::now(),
                });
                Some(HttpListener::bind(port, state, settings).await?)
            }
            None => None,
        };

        let capture = thread::Builder::new()
            .name("capture".into())
            .spawn(move || pipeline.start(&source))
            .context("failed to spawn capture thread")?;

        Ok(Self {
            pipeline: handle,
            capture: Some(capture),
            http,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.pipeline.clone()
    }

    /// Address the HTTP listener is bound to, if it is enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|h| h.addr)
    }

    /// Wait for the capture thread to finish, then shut the listener down.
    /// Returns the capture thread's fatal error, if it had one.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let result = match self.capture.take() {
            Some(capture) => tokio::task::spawn_blocking(move || capture.join())
                .await
                .context("capture join task failed")?
                .map_err(|_| anyhow::anyhow!("capture thread panicked"))
                .and_then(|r| r.map_err(anyhow::Error::from)),
            None => Ok(()),
        };

        self.pipeline.stop();
        if let Some(http) = self.http.take() {
            http.stop().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::tests::{plc_frame, receiver, ReplaySource};

    fn settings_for(destination: SocketAddr, health_check_port: u16) -> Settings {
        let config = Config {
            destination_ip: destination.ip().to_string(),
            destination_port: u32::from(destination.port()),
            health_check_port,
            ..Config::default()
        };
        config.validate().unwrap()
    }

    #[tokio::test]
    async fn test_relays_and_exits_when_source_closes() {
        let rx = receiver();
        let settings = settings_for(rx.local_addr().unwrap(), 0);

        let supervisor = Supervisor::launch(&settings, ReplaySource::new(vec![plc_frame(b"hello")]))
            .await
            .unwrap();
        assert!(supervisor.http_addr().is_none());
        let handle = supervisor.handle();
        supervisor.wait().await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(handle.stats().snapshot().forwarded, 1);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_attach_failure_is_reported() {
        let rx = receiver();
        let settings = settings_for(rx.local_addr().unwrap(), 0);
        let source = ReplaySource {
            fail_attach: true,
            ..ReplaySource::default()
        };

        let supervisor = Supervisor::launch(&settings, source).await.unwrap();
        let err = supervisor.wait().await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[tokio::test]
    async fn test_stop_through_handle_shuts_everything_down() {
        let rx = receiver();
        let mut settings = settings_for(rx.local_addr().unwrap(), 0);
        // Bind an ephemeral port for the listener.
        settings.health_check_port = Some(0);
        let source = ReplaySource {
            endless: true,
            ..ReplaySource::default()
        };

        let supervisor = Supervisor::launch(&settings, source).await.unwrap();
        assert!(supervisor.http_addr().is_some());
        let handle = supervisor.handle();
        while !handle.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(handle.stop());
        supervisor.wait().await.unwrap();
        assert!(handle.is_attached());
        assert!(!handle.is_running());
    }
}

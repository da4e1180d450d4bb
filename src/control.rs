use std::{
    io::Write,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PUSH_INTERVAL: Duration = Duration::from_millis(500);

// -------------------------------------------------------------------------------------------------

/// Line-oriented TCP status surface: one client at a time receives the current status frame
/// twice a second. The engine worker refreshes the frame whenever a client is connected.
pub struct StatusServer {
    port: u16,
    inner: Arc<StatusInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct StatusInner {
    running: AtomicBool,
    connected: AtomicBool,
    status: Mutex<String>,
}

impl StatusServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            inner: Arc::new(StatusInner {
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                status: Mutex::new(String::new()),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Bind and start accepting. A bind failure is a startup error.
    pub fn start(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .map_err(|err| Error::Config(format!("cannot bind tcp port {}: {}", self.port, err)))?;
        listener.set_nonblocking(true)?;
        log::info!("StatusServer listening on port {}", self.port);

        let inner = Arc::clone(&self.inner);
        inner.running.store(true, Ordering::Relaxed);
        let handle = std::thread::Builder::new()
            .name("status-server".to_string())
            .spawn(move || {
                while inner.running.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::info!("StatusServer client connected: {}", peer);
                            inner.serve(stream);
                            log::info!("StatusServer client disconnected");
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                        Err(err) => {
                            log::error!("StatusServer accept failed: {}", err);
                            std::thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                    }
                }
            })
            .expect("failed to spawn status server");
        *self.listener.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        let handle = self.listener.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Replace the status frame pushed to the connected client.
    pub fn set_status(&self, status: String) {
        *self.inner.status.lock().unwrap() = status;
    }
}

impl StatusInner {
    fn serve(&self, mut stream: TcpStream) {
        if stream.set_nonblocking(false).is_err() {
            return;
        }
        let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
        self.connected.store(true, Ordering::Relaxed);
        while self.running.load(Ordering::Relaxed) {
            let frame = {
                let status = self.status.lock().unwrap();
                status.clone()
            };
            if !frame.is_empty() && stream.write_all(frame.as_bytes()).is_err() {
                break;
            }
            std::thread::sleep(PUSH_INTERVAL);
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn pushes_status_frames_to_a_client() {
        // learn a free ephemeral port, then bind the server to it
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = StatusServer::new(port);
        server.start().unwrap();
        server.set_status("players: idle\n".to_string());
        assert!(!server.connected());

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 64];
        let count = client.read(&mut buf).unwrap();
        assert!(count > 0);
        assert!(String::from_utf8_lossy(&buf[..count]).contains("players"));
        assert!(server.connected());

        drop(client);
        server.stop();
        let _ = server;
    }

    #[test]
    fn occupied_port_is_a_startup_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = StatusServer::new(port);
        assert!(matches!(server.start(), Err(Error::Config(_))));
    }
}

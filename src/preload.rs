//! Background preload workers.
//!
//! A small fixed pool of executor threads for work that should not block the
//! event loop: warming external providers and the connectivity probe. Jobs
//! are fire-and-forget closures; results travel back through the store.

use crate::store::{Key, Store, Value};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct PreloadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl PreloadPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|index| {
                let receiver: Arc<Mutex<Receiver<Job>>> = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("preload-{index}"))
                    .spawn(move || loop {
                        // hold the lock only while receiving, not while working
                        let job = receiver.lock().expect("preload queue lock").recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn preload worker")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue `job` for execution on the next free worker.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                warn!("Preload pool is shut down, dropping job");
            }
        }
    }
}

impl Drop for PreloadPool {
    fn drop(&mut self) {
        // closing the channel lets workers drain remaining jobs and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Probe the connectivity checker host and record the result in the store.
///
/// The platform network monitor belongs to the UI layer; a plain TCP connect
/// against the configured checker URL is enough signal for the internet page
/// and runs fine from a preload worker.
pub fn probe_connectivity(store: &Store, checker_url: &str) {
    let online = match checker_host(checker_url) {
        Some(address) => match address.to_socket_addrs() {
            Ok(mut addrs) => addrs.any(|addr| {
                TcpStream::connect_timeout(&addr, Duration::from_secs(5)).is_ok()
            }),
            Err(e) => {
                debug!("Could not resolve connectivity checker {address}: {e}");
                false
            }
        },
        None => {
            warn!("Connectivity checker URL \"{checker_url}\" has no host");
            false
        }
    };

    info!("Connectivity probe finished: online={online}");
    store.set(Key::InternetConnection, Value::Bool(online));
}

/// `host:port` of a checker URL, defaulting the port from the scheme.
fn checker_host(url: &str) -> Option<String> {
    let (default_port, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (443, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (80, rest)
    } else {
        (80, url)
    };

    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority.to_owned())
    } else {
        Some(format!("{authority}:{default_port}"))
    }
}

//! DNS-SD (mDNS) service publisher, one per device instance: it owns a
//! single long-lived multi-service mDNS registration and retries it on
//! failure with a fixed backoff, the same shape as any other long-lived
//! client connection held open under retry.
//!
//! `mdns-sd` has no direct equivalent of Avahi's `EntryGroup::COLLISION`
//! signal, so collisions are detected preemptively: before registering a
//! candidate instance name we browse for existing records of the same
//! name and treat a hit as a collision, the same outcome Avahi would have
//! reported asynchronously.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const FAILURE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const COLLISION_PROBE_WAIT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct DnsSdTxtItem {
    pub key: String,
    pub value: String,
    pub is_url: bool,
}

#[derive(Debug, Clone)]
pub struct DnsSdService {
    /// e.g. `_ipp._tcp`.
    pub service_type: String,
    pub port: u16,
    pub txt: Vec<DnsSdTxtItem>,
    pub sub_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PublishEvent {
    Registered { instance_name: String },
    Collision { attempted_name: String },
    Failure { error: String },
}

/// Handle to a running publisher; dropping it does not stop the
/// background task — call [`Publisher::unpublish`] explicitly, matching
/// the explicit-teardown shape the owning device instance's lifecycle wants.
pub struct Publisher {
    events: mpsc::Receiver<PublishEvent>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Publisher {
    /// Register `services` under `candidate_name`, retrying collisions
    /// with `(USB)`, `(USB 2)`, ... suffixes and transient failures on a
    /// fixed interval.
    pub fn start(
        host_fqdn: String,
        loopback_only: bool,
        candidate_name: String,
        services: Vec<DnsSdService>,
        on_name_chosen: mpsc::Sender<String>,
    ) -> crate::error::Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| crate::error::Error::Io(format!("mDNS daemon init failed: {e}")))?;

        let (events_tx, events_rx) = mpsc::channel(8);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let mut current_name = candidate_name.clone();
            let mut registered_fullnames: Vec<String> = Vec::new();

            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }

                let name_to_try = suffix_for_attempt(&candidate_name, attempt);

                if name_collides(&daemon, &services, &name_to_try).await {
                    let _ = events_tx
                        .send(PublishEvent::Collision { attempted_name: name_to_try.clone() })
                        .await;
                    attempt += 1;
                    continue;
                }

                match register_all(&daemon, &name_to_try, &services, &host_fqdn, loopback_only) {
                    Ok(fullnames) => {
                        registered_fullnames = fullnames;
                        current_name = name_to_try.clone();
                        let _ = on_name_chosen.send(current_name.clone()).await;
                        let _ = events_tx
                            .send(PublishEvent::Registered { instance_name: current_name.clone() })
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = events_tx
                            .send(PublishEvent::Failure { error: e.to_string() })
                            .await;
                        tokio::time::sleep(FAILURE_RETRY_INTERVAL).await;
                    }
                }
            }

            // Hold the registration alive until told to stop.
            let _ = stop_rx.await;
            for fullname in registered_fullnames {
                if let Ok(rx) = daemon.unregister(&fullname) {
                    let _ = rx.recv_timeout(Duration::from_secs(1));
                }
            }
            let _ = daemon.shutdown();
        });

        Ok(Publisher {
            events: events_rx,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    pub async fn next_event(&mut self) -> Option<PublishEvent> {
        self.events.recv().await
    }

    /// Cleanly remove every registration and stop the retry loop.
    pub async fn unpublish(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// The first collision suffix is the bare ` (USB)`; subsequent ones number
/// from 2.
fn suffix_for_attempt(base: &str, attempt: u32) -> String {
    match attempt {
        0 => base.to_string(),
        1 => format!("{base} (USB)"),
        n => format!("{base} (USB {n})"),
    }
}

async fn name_collides(daemon: &ServiceDaemon, services: &[DnsSdService], name: &str) -> bool {
    let Some(first) = services.first() else {
        return false;
    };
    let ty_domain = format!("{}.local.", first.service_type.trim_end_matches('.'));
    let Ok(rx) = daemon.browse(&ty_domain) else {
        return false;
    };

    let deadline = tokio::time::Instant::now() + COLLISION_PROBE_WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, async { rx.recv_async().await }).await {
            Ok(Ok(mdns_sd::ServiceEvent::ServiceResolved(info))) => {
                if info.get_fullname().starts_with(&format!("{name}.")) {
                    return true;
                }
            }
            Ok(Ok(_)) => continue,
            _ => return false,
        }
    }
}

fn register_all(
    daemon: &ServiceDaemon,
    instance_name: &str,
    services: &[DnsSdService],
    host_fqdn: &str,
    loopback_only: bool,
) -> Result<Vec<String>, mdns_sd::Error> {
    let ip = if loopback_only { "127.0.0.1" } else { "0.0.0.0" };
    let mut fullnames = Vec::new();

    for service in services {
        let ty_domain = format!("{}.local.", service.service_type.trim_end_matches('.'));
        let mut props: HashMap<String, String> = HashMap::new();
        for item in &service.txt {
            let value = if item.is_url && loopback_only {
                rewrite_url_host(&item.value, "localhost")
            } else {
                item.value.clone()
            };
            props.insert(item.key.clone(), value);
        }

        let mut info = ServiceInfo::new(
            &ty_domain,
            instance_name,
            host_fqdn,
            ip,
            service.port,
            props,
        )?
        .enable_addr_auto();

        for sub_type in &service.sub_types {
            info = info.add_sub_domain(sub_type);
        }

        daemon.register(info.clone())?;
        fullnames.push(info.get_fullname().to_string());
        debug!("registered DNS-SD service {}", info.get_fullname());
    }

    info!("DNS-SD instance \"{instance_name}\" published with {} service(s)", fullnames.len());
    Ok(fullnames)
}

fn rewrite_url_host(url: &str, new_host: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let after_scheme = &url[scheme_end + 3..];
    let path_start = after_scheme.find('/').unwrap_or(after_scheme.len());
    let authority = &after_scheme[..path_start];
    let port = authority.rsplit_once(':').map(|(_, p)| p);
    let new_authority = match port {
        Some(p) => format!("{new_host}:{p}"),
        None => new_host.to_string(),
    };
    format!("{}{}{}", &url[..scheme_end + 3], new_authority, &after_scheme[path_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_collision_suffix_is_bare_usb() {
        assert_eq!(suffix_for_attempt("Printer", 0), "Printer");
        assert_eq!(suffix_for_attempt("Printer", 1), "Printer (USB)");
        assert_eq!(suffix_for_attempt("Printer", 2), "Printer (USB 2)");
        assert_eq!(suffix_for_attempt("Printer", 3), "Printer (USB 3)");
    }

    #[test]
    fn url_rewrite_preserves_port_and_path() {
        assert_eq!(
            rewrite_url_host("http://192.168.1.5:60001/icon.png", "localhost"),
            "http://localhost:60001/icon.png"
        );
        assert_eq!(
            rewrite_url_host("http://192.168.1.5/icon.png", "localhost"),
            "http://localhost/icon.png"
        );
    }
}

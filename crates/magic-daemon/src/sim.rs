//! Simulated link drivers.
//!
//! `magicd` hosts one driver per link profile. Real installations run
//! adapter processes per radio; the simulated driver stands in for them,
//! reporting a random-walked RSSI, periodic parameter reports, and a
//! scripted going-down sequence, while reading real interface counters from
//! sysfs when the interface exists.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use magic_common::config::LinkProfile;
use magic_common::types::{LinkCapability, LinkStats};
use magic_common::{BearerId, Result, SessionId};
use magic_engine::driver::{DriverEvent, DriverGrant, DriverHandle, DriverRequest, LinkDriver};
use rand::RngExt;
use tracing::{debug, info};

pub struct SimLinkDriver {
    profile: LinkProfile,
    handle: Mutex<Option<DriverHandle>>,
    rssi: Arc<Mutex<i32>>,
    stop: Arc<AtomicBool>,
    reporter: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SimLinkDriver {
    pub fn new(profile: LinkProfile) -> Arc<Self> {
        let rssi = profile.initial_rssi_dbm;
        Arc::new(SimLinkDriver {
            profile,
            handle: Mutex::new(None),
            rssi: Arc::new(Mutex::new(rssi)),
            stop: Arc::new(AtomicBool::new(false)),
            reporter: Mutex::new(None),
        })
    }

    /// Announce a graceful outage: GoingDown now, Down after the profile's
    /// lead time.
    pub fn trigger_going_down(&self) {
        let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return;
        };
        handle.raise(DriverEvent::GoingDown);
        let lead = Duration::from_millis(self.profile.going_down_lead_time_ms);
        let stop = self.stop.clone();
        thread::spawn(move || {
            thread::sleep(lead);
            if !stop.load(Ordering::Relaxed) {
                handle.raise(DriverEvent::Down);
            }
        });
    }

    /// Walk the RSSI cell one step inside `range` and return the new value.
    fn step_rssi(cell: &Mutex<i32>, range: (i32, i32)) -> i32 {
        let mut rssi = cell.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::rng();
        *rssi = (*rssi + rng.random_range(-3..=3)).clamp(range.0, range.1);
        *rssi
    }

    fn read_sysfs_counter(iface: &str, counter: &str) -> u64 {
        std::fs::read_to_string(format!("/sys/class/net/{iface}/statistics/{counter}"))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl LinkDriver for SimLinkDriver {
    fn capability(&self) -> LinkCapability {
        LinkCapability {
            link_name: self.profile.link_name.clone(),
            interface_name: self.profile.interface_name.clone(),
            link_type: self.profile.link_type,
            max_fwd_kbps: self.profile.max_fwd_kbps,
            max_rev_kbps: self.profile.max_rev_kbps,
            typical_latency_ms: self.profile.delay_ms,
            mtu: self.profile.mtu,
            security_level: self.profile.security_level,
            cost_per_mb_cents: self.profile.cost_per_mb_cents,
            priority: self.profile.priority,
            rssi_min_dbm: self.profile.rssi_min_dbm,
            rssi_max_dbm: self.profile.rssi_max_dbm,
            ground_only: self.profile.ground_only,
        }
    }

    fn gateway(&self) -> Option<IpAddr> {
        self.profile.gateway
    }

    fn statistics(&self) -> LinkStats {
        let iface = &self.profile.interface_name;
        LinkStats {
            tx_bytes: Self::read_sysfs_counter(iface, "tx_bytes"),
            rx_bytes: Self::read_sysfs_counter(iface, "rx_bytes"),
            tx_packets: Self::read_sysfs_counter(iface, "tx_packets"),
            rx_packets: Self::read_sysfs_counter(iface, "rx_packets"),
        }
    }

    fn allocate_resource(&self, request: &DriverRequest) -> Result<DriverGrant> {
        debug!(
            link = %self.profile.link_name,
            session = %request.session_id,
            fwd = request.fwd_kbps,
            rev = request.rev_kbps,
            "sim driver allocating"
        );
        let fallback = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let local_ip = self.profile.ip_address.unwrap_or(fallback);
        let gateway = self.profile.gateway.or(self.profile.ip_address).unwrap_or(fallback);
        Ok(DriverGrant {
            local_ip,
            gateway,
            dns_primary: self.profile.dns_primary.unwrap_or(fallback),
            dns_secondary: self.profile.dns_secondary.unwrap_or(fallback),
        })
    }

    fn release_resource(&self, session_id: SessionId, _bearer: BearerId) -> Result<()> {
        debug!(link = %self.profile.link_name, session = %session_id, "sim driver releasing");
        Ok(())
    }

    fn start(&self, handle: DriverHandle) {
        info!(link = %self.profile.link_name, id = %handle.link_id(), "sim driver starting");
        handle.raise(DriverEvent::Detected);
        handle.raise(DriverEvent::Up);
        handle.raise(DriverEvent::Quality {
            rssi_dbm: *self.rssi.lock().unwrap_or_else(|e| e.into_inner()),
        });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());

        // Reporting thread: RSSI walk + periodic parameter reports.
        let interval = Duration::from_secs(self.profile.reporting_interval_sec.max(1));
        let stop = self.stop.clone();
        let iface = self.profile.interface_name.clone();
        let range = (self.profile.rssi_min_dbm, self.profile.rssi_max_dbm);
        let rssi_cell = self.rssi.clone();
        let reporter = thread::Builder::new()
            .name(format!("sim-{}", self.profile.link_name))
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let rssi = SimLinkDriver::step_rssi(&rssi_cell, range);
                    handle.raise(DriverEvent::Quality { rssi_dbm: rssi });
                    handle.raise(DriverEvent::Report {
                        stats: LinkStats {
                            tx_bytes: SimLinkDriver::read_sysfs_counter(&iface, "tx_bytes"),
                            rx_bytes: SimLinkDriver::read_sysfs_counter(&iface, "rx_bytes"),
                            tx_packets: SimLinkDriver::read_sysfs_counter(&iface, "tx_packets"),
                            rx_packets: SimLinkDriver::read_sysfs_counter(&iface, "rx_packets"),
                        },
                    });
                }
            })
            .expect("failed to spawn sim reporter");
        *self.reporter.lock().unwrap_or_else(|e| e.into_inner()) = Some(reporter);
    }

    fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reporter) = self
            .reporter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = reporter.join();
        }
        info!(link = %self.profile.link_name, "sim driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magic_common::config::Ini;

    fn profile() -> LinkProfile {
        LinkProfile::from_ini(&Ini::parse(
            "[general]\nlink_name = SAT-1\nlink_type = satcom\npriority = 3\n\
             [interface]\nname = sat0\nip_address = 172.16.0.2\ngateway = 172.16.0.1\n\
             [bandwidth]\nmax_forward_link_kbps = 5000\nmax_return_link_kbps = 512\n\
             [latency]\ndelay_ms = 600\n\
             [signal]\nrssi_min_dbm = -110\nrssi_max_dbm = -60\ninitial_rssi_dbm = -80\n",
        ))
        .unwrap()
    }

    #[test]
    fn capability_mirrors_profile() {
        let driver = SimLinkDriver::new(profile());
        let cap = driver.capability();
        assert_eq!(cap.link_name, "SAT-1");
        assert_eq!(cap.interface_name, "sat0");
        assert_eq!(cap.max_fwd_kbps, 5000);
        assert_eq!(cap.typical_latency_ms, 600);
        assert_eq!(driver.gateway().unwrap().to_string(), "172.16.0.1");
    }

    #[test]
    fn rssi_walk_stays_in_range() {
        let cell = Mutex::new(-80);
        for _ in 0..200 {
            let rssi = SimLinkDriver::step_rssi(&cell, (-110, -60));
            assert!((-110..=-60).contains(&rssi));
        }
    }

    #[test]
    fn allocate_grant_uses_profile_addresses() {
        let driver = SimLinkDriver::new(profile());
        let grant = driver
            .allocate_resource(&DriverRequest {
                session_id: SessionId(1),
                client_id: "C1".into(),
                fwd_kbps: 100,
                rev_kbps: 100,
                qos: magic_common::types::QosClass::BEST_EFFORT,
                timeout_sec: 0,
            })
            .unwrap();
        assert_eq!(grant.local_ip.to_string(), "172.16.0.2");
        assert_eq!(grant.gateway.to_string(), "172.16.0.1");
    }

    #[test]
    fn shutdown_is_idempotent_without_start() {
        let driver = SimLinkDriver::new(profile());
        driver.shutdown();
        driver.shutdown();
    }
}

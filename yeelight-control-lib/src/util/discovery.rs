use std::cmp::max;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use derivative::Derivative;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::connection::ConnectionProvider;
use crate::device::props::Prop;
use crate::device::Device;
use crate::error::Error;

pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 1982;
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(2000);

pub const PROBE_MESSAGE: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
HOST:239.255.255.250:1982\r\n\
MAN:\"ssdp:discover\"\r\n\
ST:wifi_bulb\r\n";

// every response and announcement mentions the yeelight:// location scheme
const PROTOCOL_MARKER: &str = "yeelight";
const DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// How long a one-shot scan waits for responses.
    pub scan_timeout: Duration,
    /// Where the probe is sent.
    pub probe_target: SocketAddr,
    /// Port bound while listening for announcements.
    pub listen_port: u16,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            probe_target: SocketAddr::V4(SocketAddrV4::new(MULTICAST_ADDRESS, MULTICAST_PORT)),
            listen_port: MULTICAST_PORT,
        }
    }
}

/**
Outcome of [`Scanner::scan`].

Devices found before a failure are kept; the failure itself is in `error`.
Running out of time is not an error.
 */
#[derive(Debug, Default)]
pub struct ScanResult {
    pub devices: HashMap<u64, Arc<Device>>,
    pub error: Option<anyhow::Error>,
}

/// Decodes a discovery datagram into its header map. Foreign payloads decode to an empty map.
pub fn parse_datagram(data: &[u8]) -> HashMap<String, String> {
    let text: String = String::from_utf8_lossy(data)
        .chars()
        .filter(|c| *c != '\r')
        .collect();
    if !text.contains(PROTOCOL_MARKER) {
        error!("Invalid discovery message: {}", text);
        return HashMap::new();
    }
    debug!("{}", text);
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/**
Finds lights on the local network.

[`Scanner::scan`] sends one multicast probe and collects the responses until
the timeout. [`Scanner::listen`] waits for the announcements lights send when
they join the network or change state, until [`Scanner::stop`] is called.
Both can be stopped from another task.
 */
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Scanner {
    config: ScannerConfig,
    #[derivative(Debug = "ignore")]
    provider: Option<Arc<dyn ConnectionProvider>>,
    // millis since the epoch, 0 if never
    last_scan: AtomicI64,
    socket_open: AtomicBool,
    scanning: AtomicBool,
    stop_signal: watch::Sender<u64>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(ScannerConfig::default())
    }
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        let (stop_signal, _) = watch::channel(0);
        Scanner {
            config,
            provider: None,
            last_scan: AtomicI64::new(0),
            socket_open: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
            stop_signal,
        }
    }

    /// Every device found gets `provider` for its connections.
    pub fn with_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn connection_provider(&self) -> Option<&Arc<dyn ConnectionProvider>> {
        self.provider.as_ref()
    }

    /// True once a scan has completed without error.
    pub fn was_scan_run(&self) -> bool {
        self.last_scan.load(Ordering::SeqCst) != 0
    }

    pub fn last_scan_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.last_scan.load(Ordering::SeqCst) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    pub fn is_socket_open(&self) -> bool {
        self.socket_open.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Scans with the configured timeout.
    pub async fn scan(&self) -> ScanResult {
        self.scan_for(self.config.scan_timeout).await
    }

    /// Probes the network and collects responses for `timeout`. The first
    /// response of each device id wins.
    pub async fn scan_for(&self, timeout: Duration) -> ScanResult {
        // subscribed before scanning becomes visible to stop()
        let stop = self.stop_signal.subscribe();
        self.socket_open.store(true, Ordering::SeqCst);
        self.scanning.store(true, Ordering::SeqCst);
        debug!("scan: started");
        let mut devices = HashMap::new();
        let error = self.run_scan(timeout, stop, &mut devices).await.err();
        if error.is_none() {
            self.last_scan
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        }
        self.socket_open.store(false, Ordering::SeqCst);
        self.scanning.store(false, Ordering::SeqCst);
        debug!("scan: finished, {} device(s)", devices.len());
        ScanResult { devices, error }
    }

    async fn run_scan(
        &self,
        timeout: Duration,
        mut stop: watch::Receiver<u64>,
        devices: &mut HashMap<u64, Arc<Device>>,
    ) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to open discovery socket")?;
        socket
            .send_to(PROBE_MESSAGE, self.config.probe_target)
            .await
            .context("Failed to send discovery probe")?;
        debug!("scan: probe sent to {}", self.config.probe_target);

        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; DATAGRAM_SIZE];
        while self.is_socket_open() {
            let received = tokio::select! {
                _ = stop.changed() => break,
                received = timeout_at(deadline, socket.recv_from(&mut buffer)) => received,
            };
            let (length, source) = match received {
                Ok(received) => received.context("Failed to receive discovery response")?,
                Err(_) => break,
            };
            let map = parse_datagram(&buffer[..length]);
            if map.is_empty() {
                continue;
            }
            match self.build_device(&map) {
                Ok(device) => {
                    if devices.contains_key(&device.id()) {
                        debug!("scan: {} answered again, skipping", device.id());
                    } else {
                        info!("Found device {} at {}", device.id(), source);
                        devices.insert(device.id(), device);
                    }
                }
                Err(e) => warn!("scan: ignoring response from {}: {}", source, e),
            }
        }
        Ok(())
    }

    /**
    Calls `on_device` for each announcement until [`Scanner::stop`].

    Fails with [`Error::AlreadyListening`] if a socket of this scanner is
    already open.
     */
    pub async fn listen<F>(&self, mut on_device: F) -> anyhow::Result<()>
    where
        F: FnMut(Arc<Device>) + Send,
    {
        if self
            .socket_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyListening.into());
        }
        let result = self.run_listen(&mut on_device).await;
        self.socket_open.store(false, Ordering::SeqCst);
        result
    }

    async fn run_listen<F>(&self, on_device: &mut F) -> anyhow::Result<()>
    where
        F: FnMut(Arc<Device>) + Send,
    {
        let mut stop = self.stop_signal.subscribe();
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port))
            .await
            .context("Failed to open listener socket")?;
        if let Err(e) = socket.join_multicast_v4(MULTICAST_ADDRESS, Ipv4Addr::UNSPECIFIED) {
            warn!("listen: cannot join {}: {}", MULTICAST_ADDRESS, e);
        }
        if let Err(e) = socket.set_multicast_loop_v4(true) {
            warn!("listen: {}", e);
        }
        debug!("listen: socket opened on port {}", self.config.listen_port);

        let mut buffer = [0u8; DATAGRAM_SIZE];
        while self.is_socket_open() {
            let received = tokio::select! {
                _ = stop.changed() => break,
                received = socket.recv_from(&mut buffer) => received,
            };
            let (length, source) = received.context("Failed to receive announcement")?;
            let map = parse_datagram(&buffer[..length]);
            if map.is_empty() {
                continue;
            }
            match self.build_device(&map) {
                Ok(device) => on_device(device),
                Err(e) => warn!("listen: ignoring announcement from {}: {}", source, e),
            }
        }
        debug!("listen: stopped");
        Ok(())
    }

    /// Ends a running scan or listen. Safe to call at any time.
    pub fn stop(&self) {
        self.socket_open.store(false, Ordering::SeqCst);
        self.stop_signal.send_modify(|generation| *generation += 1);
    }

    fn build_device(&self, map: &HashMap<String, String>) -> Result<Arc<Device>, Error> {
        let device = Device::from_discovery_map(map)?;
        device.set_connection_provider(self.provider.clone());
        Ok(Arc::new(device))
    }

    pub fn pretty_print_devices(devices: &HashMap<u64, Arc<Device>>) {
        let mut devices: Vec<_> = devices.values().collect();
        devices.sort_by_key(|d| d.id());

        let ids: Vec<String> = devices.iter().map(|d| format!("0x{:016x}", d.id())).collect();
        let addresses: Vec<String> = devices
            .iter()
            .map(|d| format!("{}:{}", d.address(), d.port()))
            .collect();
        let names: Vec<String> = devices
            .iter()
            .map(|d| d.props().get_text(Prop::Name).unwrap_or_default().to_string())
            .collect();

        let id_width = ids.iter().map(|s| s.len()).max().unwrap_or(0).max("Device ID".len());
        let address_width = addresses
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0)
            .max("Address".len());
        let model_width = devices
            .iter()
            .map(|d| d.model().len())
            .max()
            .unwrap_or(0)
            .max("Model".len());
        let name_width = names.iter().map(|s| max(s.len(), 12)).max().unwrap_or(12);

        println!(
            "{:<id_width$} {:<address_width$} {:<model_width$} {:<name_width$} {}",
            "Device ID",
            "Address",
            "Model",
            "Name",
            "Power",
            id_width = id_width + 2,
            address_width = address_width + 2,
            model_width = model_width + 2,
            name_width = name_width + 2,
        );
        println!(
            "{:<id_width$} {:<address_width$} {:<model_width$} {:<name_width$} {}",
            "-".repeat(id_width),
            "-".repeat(address_width),
            "-".repeat(model_width),
            "-".repeat(name_width),
            "-----",
            id_width = id_width + 2,
            address_width = address_width + 2,
            model_width = model_width + 2,
            name_width = name_width + 2,
        );
        for (i, device) in devices.iter().enumerate() {
            let power = if device.props().get_bool(Prop::Power) {
                "on"
            } else {
                "off"
            };
            println!(
                "{:<id_width$} {:<address_width$} {:<model_width$} {:<name_width$} {}",
                ids[i],
                addresses[i],
                device.model(),
                names[i],
                power,
                id_width = id_width + 2,
                address_width = address_width + 2,
                model_width = model_width + 2,
                name_width = name_width + 2,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BasicConnection, Connection, ConnectionConfig, ConnectionPool};
    use crate::device::method::Method;
    use parking_lot::Mutex;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn response(id: &str, address: &str, name: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\n\
             Cache-Control: max-age=3600\r\n\
             Date: \r\n\
             Ext: \r\n\
             Location: yeelight://{}:55443\r\n\
             Server: POSIX UPnP/1.0 YGLC/1\r\n\
             id: {}\r\n\
             model: color\r\n\
             fw_ver: 18\r\n\
             support: get_prop set_default set_power toggle set_bright cron_add cron_get cron_del set_rgb\r\n\
             power: on\r\n\
             bright: 100\r\n\
             color_mode: 2\r\n\
             ct: 4000\r\n\
             name: {}\r\n",
            address, id, name
        )
        .into_bytes()
    }

    fn loopback_config(probe_target: SocketAddr, scan_timeout: Duration) -> ScannerConfig {
        ScannerConfig {
            scan_timeout,
            probe_target,
            listen_port: 0,
        }
    }

    #[test]
    fn test_parse_datagram() {
        let map = parse_datagram(
            b"ID: 0x0000000000000001\r\nLocation: yeelight://192.168.1.5:55443\r\nno colon here\r\n",
        );
        assert_eq!(map.get("ID").map(String::as_str), Some("0x0000000000000001"));
        assert_eq!(
            map.get("Location").map(String::as_str),
            Some("yeelight://192.168.1.5:55443")
        );
        assert_eq!(map.len(), 2);

        let device = Device::from_discovery_map(&map).unwrap();
        assert_eq!(device.id(), 1);
        assert_eq!(device.address(), "192.168.1.5");
        assert_eq!(device.port(), 55443);
    }

    #[test]
    fn test_foreign_datagram_is_empty() {
        init_logger();
        assert!(parse_datagram(b"HTTP/1.1 200 OK\r\nLocation: http://10.0.0.1/desc.xml\r\n").is_empty());
    }

    #[tokio::test]
    async fn test_scan_collects_first_response_per_device() {
        init_logger();
        let stub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = stub.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let (length, scanner) = stub.recv_from(&mut buffer).await.unwrap();
            assert_eq!(&buffer[..length], PROBE_MESSAGE);
            for datagram in [
                response("0x01", "127.0.0.1", "desk"),
                response("0x01", "127.0.0.1", "again"),
                b"not a light".to_vec(),
                response("0x02", "127.0.0.2", "hall"),
            ] {
                stub.send_to(&datagram, scanner).await.unwrap();
            }
        });

        let scanner = Scanner::new(loopback_config(target, Duration::from_millis(300)));
        assert!(!scanner.was_scan_run());
        let result = scanner.scan().await;

        assert!(result.error.is_none());
        assert_eq!(result.devices.len(), 2);
        let desk = &result.devices[&1];
        assert_eq!(desk.props().get_text(Prop::Name), Some("desk"));
        assert!(desk.supports(Method::CronGet));
        assert_eq!(result.devices[&2].address(), "127.0.0.2");

        assert!(scanner.was_scan_run());
        assert!(scanner.last_scan_timestamp().is_some());
        assert!(!scanner.is_scanning());
        assert!(!scanner.is_socket_open());
    }

    #[tokio::test]
    async fn test_stop_ends_scan_early() {
        init_logger();
        let stub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = stub.local_addr().unwrap();
        let scanner = Arc::new(Scanner::new(loopback_config(target, Duration::from_secs(30))));

        let scanning = scanner.clone();
        let scan = tokio::spawn(async move { scanning.scan().await });
        let mut buffer = [0u8; 1024];
        stub.recv_from(&mut buffer).await.unwrap();
        assert!(scanner.is_scanning());

        scanner.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), scan)
            .await
            .unwrap()
            .unwrap();
        assert!(result.devices.is_empty());
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_scanned_devices_get_provider() {
        init_logger();
        let stub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = stub.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let (_, scanner) = stub.recv_from(&mut buffer).await.unwrap();
            stub.send_to(&response("0x07", "127.0.0.1", "lamp"), scanner)
                .await
                .unwrap();
        });

        let pool: Arc<dyn ConnectionProvider> = Arc::new(ConnectionPool::new(Box::new(
            |device: &Arc<Device>| -> Arc<dyn Connection> {
                Arc::new(BasicConnection::for_device(device, ConnectionConfig::default()))
            },
        )));
        let scanner = Scanner::new(loopback_config(target, Duration::from_millis(300)))
            .with_provider(pool);
        let result = scanner.scan().await;

        let lamp = &result.devices[&7];
        assert!(lamp.can_connect());
        assert_eq!(lamp.connection().unwrap().device_id(), 7);
    }

    #[tokio::test]
    async fn test_listen_reports_announcements_until_stopped() {
        init_logger();
        let port = {
            let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let scanner = Arc::new(Scanner::new(ScannerConfig {
            listen_port: port,
            ..ScannerConfig::default()
        }));
        let announced = Arc::new(Mutex::new(Vec::new()));

        let listening = scanner.clone();
        let sink = announced.clone();
        let listen = tokio::spawn(async move {
            listening
                .listen(move |device| sink.lock().push(device.id()))
                .await
        });
        for _ in 0..100 {
            if scanner.is_socket_open() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scanner.is_socket_open());

        let second = scanner.listen(|_| {}).await.unwrap_err();
        assert!(matches!(
            second.downcast_ref::<Error>(),
            Some(Error::AlreadyListening)
        ));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..100 {
            sender
                .send_to(&response("0x0a", "127.0.0.1", "porch"), ("127.0.0.1", port))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !announced.lock().is_empty() {
                break;
            }
        }
        assert_eq!(announced.lock().first(), Some(&10));

        scanner.stop();
        tokio::time::timeout(Duration::from_secs(5), listen)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!scanner.is_socket_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_as_soon_as_scanning_is_seen() {
        init_logger();
        let stub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = stub.local_addr().unwrap();
        let scanner = Arc::new(Scanner::new(loopback_config(target, Duration::from_secs(30))));

        let scanning = scanner.clone();
        let scan = tokio::spawn(async move { scanning.scan().await });
        while !scanner.is_scanning() && !scan.is_finished() {
            tokio::task::yield_now().await;
        }
        scanner.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), scan)
            .await
            .unwrap()
            .unwrap();
        assert!(result.error.is_none());
        assert!(!scanner.is_scanning());
    }
}

use crate::error::BenchError;
use log::{debug, warn};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Line-oriented command channel to one instrument
pub trait Transport: Send {
    /// Send a command that produces no response
    fn write(&mut self, command: &str) -> Result<(), BenchError>;

    /// Send a command and return its single-line response, terminator stripped
    fn query(&mut self, command: &str) -> Result<String, BenchError>;

    fn close(&mut self) -> Result<(), BenchError> {
        Ok(())
    }
}

/// Opens instrument transports from VISA-style resource addresses
pub trait ResourceManager {
    fn open_resource(&self, address: &str) -> Result<Box<dyn Transport>, BenchError>;

    /// Addresses this manager knows about; may be empty when the bus cannot be enumerated
    fn list_resources(&self) -> Result<Vec<String>, BenchError>;
}

/// Timeout settings for socket instruments
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Appended to every command
    pub terminator: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            terminator: "\n".to_string(),
        }
    }
}

/// Parsed `TCPIP[board]::host::port::SOCKET` resource string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketResource {
    pub host: String,
    pub port: u16,
}

impl SocketResource {
    pub fn parse(address: &str) -> Result<Self, BenchError> {
        let invalid = || BenchError::InvalidAddress(address.to_string());
        let parts: Vec<&str> = address.trim().split("::").collect();

        match parts.as_slice() {
            [interface, host, port, kind]
                if interface.to_uppercase().starts_with("TCPIP")
                    && kind.eq_ignore_ascii_case("SOCKET")
                    && !host.is_empty() =>
            {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(invalid()),
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, BenchError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| BenchError::InvalidAddress(format!("{}:{}", self.host, self.port)))?
            .next()
            .ok_or_else(|| BenchError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

/// Resource manager for instruments reachable as raw SCPI sockets
/// (LAN instruments, GPIB-Ethernet bridges)
#[derive(Debug, Clone, Default)]
pub struct TcpResourceManager {
    config: ConnectionConfig,
}

impl TcpResourceManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

impl ResourceManager for TcpResourceManager {
    fn open_resource(&self, address: &str) -> Result<Box<dyn Transport>, BenchError> {
        let resource = SocketResource::parse(address)?;
        Ok(Box::new(TcpTransport::connect(&resource, &self.config)?))
    }

    fn list_resources(&self) -> Result<Vec<String>, BenchError> {
        debug!("Socket resources cannot be enumerated");
        Ok(Vec::new())
    }
}

pub struct TcpTransport {
    peer: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    terminator: String,
}

impl TcpTransport {
    pub fn connect(resource: &SocketResource, config: &ConnectionConfig) -> Result<Self, BenchError> {
        let socket_addr = resource.socket_addr()?;
        let peer = format!("{}:{}", resource.host, resource.port);
        debug!("Connecting to instrument at {peer}");

        let stream = TcpStream::connect_timeout(&socket_addr, config.connect_timeout).map_err(|e| {
            warn!("Failed to connect to {peer}: {e}");
            map_io(e)
        })?;
        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        stream.set_nodelay(true)?;

        let writer = stream.try_clone()?;
        Ok(Self {
            peer,
            reader: BufReader::new(stream),
            writer,
            terminator: config.terminator.clone(),
        })
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, command: &str) -> Result<(), BenchError> {
        let line = format!("{command}{}", self.terminator);
        self.writer.write_all(line.as_bytes()).map_err(map_io)?;
        self.writer.flush().map_err(map_io)
    }

    fn query(&mut self, command: &str) -> Result<String, BenchError> {
        self.write(command)?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(map_io)?;
        if read == 0 {
            return Err(BenchError::Protocol(format!(
                "{} closed the connection while answering '{command}'",
                self.peer
            )));
        }
        Ok(line.trim_end().to_string())
    }

    fn close(&mut self) -> Result<(), BenchError> {
        match self.writer.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn map_io(e: std::io::Error) -> BenchError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => BenchError::Timeout,
        _ => BenchError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_parse_socket_resource() {
        let resource = SocketResource::parse("TCPIP0::192.168.1.20::5025::SOCKET").unwrap();
        assert_eq!(resource.host, "192.168.1.20");
        assert_eq!(resource.port, 5025);

        let resource = SocketResource::parse("tcpip::lia.lab.local::1234::socket").unwrap();
        assert_eq!(resource.host, "lia.lab.local");
    }

    #[test]
    fn test_parse_rejects_other_resources() {
        for address in [
            "GPIB0::22::INSTR",
            "TCPIP0::192.168.1.20::inst0::INSTR",
            "TCPIP0::192.168.1.20::notaport::SOCKET",
            "TCPIP0::::5025::SOCKET",
            "",
        ] {
            assert!(
                matches!(SocketResource::parse(address), Err(BenchError::InvalidAddress(_))),
                "{address}"
            );
        }
    }

    #[test]
    fn test_tcp_query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            while !received.ends_with(b"*IDN?\n") {
                let n = stream.read(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(b"ACME,SMU-1,0001,1.0\r\n").unwrap();
            String::from_utf8(received).unwrap()
        });

        let manager = TcpResourceManager::default();
        let mut transport = manager
            .open_resource(&format!("TCPIP0::127.0.0.1::{port}::SOCKET"))
            .unwrap();
        transport.write("*RST").unwrap();
        assert_eq!(transport.query("*IDN?").unwrap(), "ACME,SMU-1,0001,1.0");
        transport.close().unwrap();

        assert_eq!(server.join().unwrap(), "*RST\n*IDN?\n");
    }
}

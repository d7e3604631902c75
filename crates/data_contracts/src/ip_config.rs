use crate::partition::ContractError;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 30050;

/// Transport the graph runtime would use between machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetType {
    #[default]
    Socket,
    TensorPipe,
}

impl FromStr for NetType {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(Self::Socket),
            "tensorpipe" => Ok(Self::TensorPipe),
            other => Err(ContractError::NetType(other.to_string())),
        }
    }
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => f.write_str("socket"),
            Self::TensorPipe => f.write_str("tensorpipe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineAddr {
    pub ip: IpAddr,
    pub port: u16,
}

/// Machines of the cluster (`--ip_config`), one `ip [port]` per line.
///
/// Blank lines and `#` comments are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub machines: Vec<MachineAddr>,
}

impl IpConfig {
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let text = fs::read_to_string(path).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ContractError> {
        let mut machines = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let ip = fields
                .next()
                .unwrap_or_default()
                .parse::<IpAddr>()
                .map_err(|e| ContractError::IpConfig {
                    line: idx + 1,
                    msg: e.to_string(),
                })?;
            let port = match fields.next() {
                Some(p) => p.parse::<u16>().map_err(|e| ContractError::IpConfig {
                    line: idx + 1,
                    msg: format!("bad port {p:?}: {e}"),
                })?,
                None => DEFAULT_PORT,
            };
            machines.push(MachineAddr { ip, port });
        }
        if machines.is_empty() {
            return Err(ContractError::IpConfig {
                line: 0,
                msg: "no machines listed".into(),
            });
        }
        Ok(Self { machines })
    }

    pub fn num_machines(&self) -> usize {
        self.machines.len()
    }

    pub fn all_loopback(&self) -> bool {
        self.machines.iter().all(|m| m.ip.is_loopback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_with_and_without_port() {
        let cfg = IpConfig::parse("127.0.0.1 4000\n# comment\n\n127.0.0.1\n").unwrap();
        assert_eq!(cfg.num_machines(), 2);
        assert_eq!(cfg.machines[0].port, 4000);
        assert_eq!(cfg.machines[1].port, DEFAULT_PORT);
        assert!(cfg.all_loopback());
    }

    #[test]
    fn rejects_garbage_ip() {
        let err = IpConfig::parse("not-an-ip\n").unwrap_err();
        assert!(matches!(err, ContractError::IpConfig { line: 1, .. }));
    }

    #[test]
    fn net_type_round_trips_names() {
        assert_eq!("socket".parse::<NetType>().unwrap(), NetType::Socket);
        assert_eq!("TensorPipe".parse::<NetType>().unwrap(), NetType::TensorPipe);
        assert!("ib".parse::<NetType>().is_err());
    }
}

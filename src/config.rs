//! Configuration management for the handover simulator.
//!
//! This module handles loading and saving configuration from disk,
//! including the simulated phones and the handover cadence.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{HandoverError, Result},
   handover::coordinator::{DEFAULT_WINDOW, MIN_WINDOW},
   peer::{BdAddr, PeerIdentity, Transport},
};

/// Main configuration structure for the simulator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Transfer window handed to each profile, in bytes.
   #[serde(default = "default_window_size")]
   pub window_size: usize,

   #[serde(default = "default_handover_interval")]
   pub handover_interval_sec: u64,

   /// Vetoed attempts retried before waiting for the next interval.
   #[serde(default = "default_veto_retry_count")]
   pub veto_retry_count: u32,

   #[serde(default = "default_traffic_interval")]
   pub traffic_interval_ms: u64,

   #[serde(default)]
   pub peers: Vec<PeerConfig>,
}

/// A simulated phone or accessory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PeerConfig {
   pub address: BdAddr,
   #[serde(default)]
   pub transport: Transport,
   pub name: SmolStr,
   /// Whether audio is streaming when the peer connects.
   #[serde(default)]
   pub streaming: bool,
}

impl PeerConfig {
   pub const fn identity(&self) -> PeerIdentity {
      PeerIdentity::new(self.address, self.transport)
   }
}

const fn default_window_size() -> usize {
   DEFAULT_WINDOW
}

const fn default_handover_interval() -> u64 {
   15
}

const fn default_veto_retry_count() -> u32 {
   5
}

const fn default_traffic_interval() -> u64 {
   250
}

impl Default for Config {
   fn default() -> Self {
      Self {
         window_size: default_window_size(),
         handover_interval_sec: default_handover_interval(),
         veto_retry_count: default_veto_retry_count(),
         traffic_interval_ms: default_traffic_interval(),
         peers: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         let config: Self = toml::from_str(&contents)?;
         config.validate()?;
         Ok(config)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn validate(&self) -> Result<()> {
      if self.window_size < MIN_WINDOW || self.window_size > usize::from(u16::MAX) {
         return Err(HandoverError::InvalidConfig(format!(
            "window_size must be between {MIN_WINDOW} and {}, got {}",
            u16::MAX,
            self.window_size
         )));
      }
      if self.handover_interval_sec == 0 {
         return Err(HandoverError::InvalidConfig(
            "handover_interval_sec must be positive".into(),
         ));
      }
      if self.traffic_interval_ms == 0 {
         return Err(HandoverError::InvalidConfig(
            "traffic_interval_ms must be positive".into(),
         ));
      }
      for (i, peer) in self.peers.iter().enumerate() {
         if peer.address.is_any() {
            return Err(HandoverError::InvalidConfig(format!("peer {} has no address", peer.name)));
         }
         if self.peers[..i].iter().any(|p| p.identity() == peer.identity()) {
            return Err(HandoverError::InvalidConfig(format!(
               "peer {} listed twice",
               peer.identity()
            )));
         }
      }
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("TWS_HANDOVER_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(HandoverError::ConfigDirNotFound);
      };

      Ok(config_dir.join("tws-handover").join("config.toml"))
   }

   /// Looks up the configured name of a peer.
   pub fn peer_name(&self, peer: &PeerIdentity) -> Option<&str> {
      self
         .peers
         .iter()
         .find(|p| p.identity() == *peer)
         .map(|p| p.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn phone() -> PeerConfig {
      PeerConfig {
         address: "00:1A:7D:DA:71:13".parse().unwrap(),
         transport: Transport::BrEdr,
         name: "Phone".into(),
         streaming: true,
      }
   }

   #[test]
   fn test_missing_file_creates_default() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("tws-handover").join("config.toml");
      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
   }

   #[test]
   fn test_save_and_reload() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      let config = Config {
         window_size: 32,
         peers: vec![phone()],
         ..Default::default()
      };
      config.save_to(&path).unwrap();
      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded, config);
      assert_eq!(loaded.peer_name(&phone().identity()), Some("Phone"));
   }

   #[test]
   fn test_defaults_fill_missing_keys() {
      let config: Config = toml::from_str(
         r#"
            window_size = 16

            [[peers]]
            address = "C0:11:22:33:44:55"
            transport = "le"
            name = "Watch"
         "#,
      )
      .unwrap();
      assert_eq!(config.window_size, 16);
      assert_eq!(config.handover_interval_sec, 15);
      assert_eq!(config.peers[0].transport, Transport::Le);
      assert!(!config.peers[0].streaming);
   }

   #[test]
   fn test_validate_rejects_bad_values() {
      let tiny = Config {
         window_size: 4,
         ..Default::default()
      };
      assert!(matches!(tiny.validate(), Err(HandoverError::InvalidConfig(_))));

      let twice = Config {
         peers: vec![phone(), phone()],
         ..Default::default()
      };
      assert!(twice.validate().is_err());

      let anonymous = Config {
         peers: vec![PeerConfig {
            address: BdAddr::any(),
            ..phone()
         }],
         ..Default::default()
      };
      assert!(anonymous.validate().is_err());
   }

   #[test]
   fn test_invalid_file_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "window_size = \"wide\"").unwrap();
      assert!(matches!(Config::load_from(&path), Err(HandoverError::TomlParse(_))));
   }
}

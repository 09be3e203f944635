use crate::error::Error;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::time::Duration;

/**
 * Wrapper for the link configurations. Built once by the surrounding
 * application and handed to the connectors and the Link explicitly.
 * Every field is optional in the TOML file and falls back to its default.
*/
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Configuration {
    ///Overall deadline in milliseconds for a connect race.
    pub connect_timeout: u64,

    ///Upper bound in milliseconds of a single outbound dial attempt.
    pub dial_attempt_timeout: u64,

    ///Parameters of the wait between two outbound dial attempts.
    pub backoff: Backoff,

    ///Interval in milliseconds between two polls of the listening socket.
    pub accept_poll_interval: u64,

    ///Timeout in milliseconds for each step of the handshake.
    pub handshake_timeout: u64,

    ///Largest accepted application frame in bytes.
    pub max_frame_size: usize,

    ///Host the Link binds its listening socket to.
    pub bind_host: String,

    ///Stack size of the spawned race threads in bytes.
    pub thread_stack_size: usize,

    ///Address echo service queried for the external address.
    pub external_address_url: String,

    ///Timeout in milliseconds of the external address lookup.
    pub external_address_timeout: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            connect_timeout: 30_000,
            dial_attempt_timeout: 1_000,
            backoff: Backoff::default(),
            accept_poll_interval: 25,
            handshake_timeout: 5_000,
            max_frame_size: 16 * 1024 * 1024,
            bind_host: "0.0.0.0".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
            external_address_url: "https://api.ipify.org".to_string(),
            external_address_timeout: 5_000,
        }
    }
}

impl Configuration {
    /**
     * Returns the race deadline wrapped in a Duration.
     */
    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /**
     * Returns the dial attempt timeout wrapped in a Duration.
     */
    pub fn get_dial_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_attempt_timeout)
    }

    /**
     * Returns the accept poll interval wrapped in a Duration.
     */
    pub fn get_accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval.max(1))
    }

    /**
     * Returns the handshake timeout wrapped in a Duration.
     */
    pub fn get_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout)
    }

    pub fn get_external_address_timeout(&self) -> Duration {
        Duration::from_millis(self.external_address_timeout)
    }
}

/**
 * Configuration parameters for the outbound leg's retry loop.
 */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Backoff {
    ///Wait in milliseconds after the first failed dial.
    pub initial: u64,

    ///Upper value in milliseconds of the doubling wait.
    pub max: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: 100,
            max: 2_000,
        }
    }
}

impl Backoff {
    /**
     * Returns the first wait wrapped in a Duration.
     */
    pub fn get_initial(&self) -> Duration {
        Duration::from_millis(self.initial)
    }

    /**
     * Returns the wait that follows `current`: doubled, capped at the
     * configured maximum.
     *
     * # Arguments
     *
     * `current` - Wait used after the previous failed attempt.
     */
    pub fn next(&self, current: Duration) -> Duration {
        let max = Duration::from_millis(self.max);

        if current * 2 <= max {
            current * 2
        } else {
            max
        }
    }
}

/**
 * Reads the link configuration from a TOML file.
 * An error is returned if not successful.
 *
 * # Arguments
 *
 * `configuration_file_path` - path to the TOML configuration file.
 */
pub fn read_configuration_file<P: AsRef<Path>>(
    configuration_file_path: P,
) -> Result<Configuration, Error> {
    let path = configuration_file_path.as_ref();
    let mut configuration_string = String::new();

    File::open(path)
        .and_then(|mut file| file.read_to_string(&mut configuration_string))
        .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;

    toml::from_str(&configuration_string)
        .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
}

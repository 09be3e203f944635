use crate::configuration::link_configuration::Configuration;
use crate::error::Error;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

/**
 * Lists the addresses of the local network interfaces, loopback excluded.
 * The surrounding application shows these to the user so they can be handed
 * to the remote peer.
 *
 * # Arguments
 *
 * `ipv4_only` - Skip the IPv6 addresses.
 */
pub fn list_local_addresses(ipv4_only: bool) -> Result<BTreeSet<String>, Error> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| Error::Discovery(format!("could not list network interfaces: {}", e)))?;

    let addresses: BTreeSet<String> = interfaces
        .iter()
        .filter(|interface| !interface.is_loopback())
        .map(|interface| interface.ip())
        .filter(|ip| !ipv4_only || ip.is_ipv4())
        .map(|ip| ip.to_string())
        .collect();

    debug!(count = addresses.len(), ipv4_only, "listed local addresses");

    Ok(addresses)
}

/**
 * Asks the configured echo service which address this host is seen from.
 * The service must answer with the bare IP address as plain text.
 *
 * # Arguments
 *
 * `configuration` - Supplies the echo service URL and the lookup timeout.
 */
pub fn external_address(configuration: &Configuration) -> Result<String, Error> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(configuration.get_external_address_timeout()))
        .build()
        .into();

    let body = agent
        .get(configuration.external_address_url.as_str())
        .call()
        .and_then(|mut response| response.body_mut().read_to_string())
        .map_err(|e| {
            Error::Discovery(format!(
                "querying {} failed: {}",
                configuration.external_address_url, e
            ))
        })?;

    let address = parse_echo_response(&body)?;
    debug!(%address, "discovered external address");

    Ok(address)
}

fn parse_echo_response(body: &str) -> Result<String, Error> {
    let text = body.trim();

    text.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| Error::Discovery(format!("echo service answered {:?}", text)))
}

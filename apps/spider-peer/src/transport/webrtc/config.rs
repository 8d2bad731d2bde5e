use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

/// Which candidate types the peer connection may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IcePolicy {
    #[default]
    All,
    /// TURN-relayed candidates only.
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
}

/// Configuration for the WebRTC peer connection
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// STUN/TURN servers offered to ICE
    pub ice_servers: Vec<RTCIceServer>,
    pub ice_policy: IcePolicy,
}

impl PeerConfig {
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::new()
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_transport_policy: match self.ice_policy {
                IcePolicy::All => RTCIceTransportPolicy::All,
                IcePolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        }
    }
}

/// Builder for [`PeerConfig`]
#[derive(Debug, Default)]
pub struct PeerConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
    ice_policy: IcePolicy,
}

impl PeerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        #[allow(clippy::needless_update)]
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    /// STUN on `host`, plus UDP and TCP TURN on the same host when
    /// credentials are given. An empty host adds nothing.
    pub fn ice_host(self, host: &str, turn: Option<&TurnCredentials>) -> Self {
        let host = host.trim();
        if host.is_empty() {
            return self;
        }
        let builder = self.add_ice_server(vec![format!("stun:{host}")]);
        match turn {
            Some(turn) => builder.add_ice_server_with_credentials(
                vec![
                    format!("turn:{host}?transport=udp"),
                    format!("turn:{host}?transport=tcp"),
                ],
                turn.username.clone(),
                turn.credential.clone(),
            ),
            None => builder,
        }
    }

    pub fn ice_policy(mut self, policy: IcePolicy) -> Self {
        self.ice_policy = policy;
        self
    }

    pub fn build(self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers,
            ice_policy: self.ice_policy,
        }
    }
}

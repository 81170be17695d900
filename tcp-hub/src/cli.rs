use std::net::{IpAddr, SocketAddr};

use clap::{Args, Parser, Subcommand, builder::NonEmptyStringValueParser};

use crate::{hub::HubConfig, id::Identity, message::DEFAULT_MAX_BODY_LEN};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, relaying payloads between connected clients.
    Server(ServerArgs),
    /// Send a single request to a running hub and print the result.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Largest relay body a client may send.
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_LEN)]
    pub max_body_bytes: usize,
}

impl ServerArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            listen: SocketAddr::new(self.bind, self.port),
            max_body_len: self.max_body_bytes,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the hub.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port of the hub.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    #[command(subcommand)]
    pub request: Request,
}

impl ClientArgs {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Request {
    /// Ask the hub for this connection's identity.
    Identity,
    /// List the identities of the other connected clients.
    List,
    /// Relay a message to other clients.
    Relay(RelayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Comma separated receiver identities, e.g. `2,3`.
    #[arg(long, value_delimiter = ',', required = true)]
    pub to: Vec<Identity>,

    /// Message body to relay.
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    pub message: String,
}

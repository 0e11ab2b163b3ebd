use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::protocol::DEFAULT_MAX_LINE_BYTES;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections from chat clients.
    Server(ServerArgs),
    /// Connect to a chat server and take part in the conversation.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9997")]
    pub listen: SocketAddr,

    /// Refuse new participants once this many are online.
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Lines queued per participant before further broadcasts to it are dropped.
    #[arg(long, default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Longest accepted line in bytes; longer lines end the sender's session.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the chat server to connect to.
    #[arg(long, default_value = "127.0.0.1:9997")]
    pub server: SocketAddr,

    /// Display name to send instead of answering the server's prompt.
    #[arg(long)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_lab_setup() {
        let cli = Cli::parse_from(["chat", "server"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };

        assert_eq!(args.listen, "127.0.0.1:9997".parse().unwrap());
        assert_eq!(args.max_clients, None);
        assert_eq!(args.outbound_buffer, 256);
        assert_eq!(args.max_line_bytes, DEFAULT_MAX_LINE_BYTES);
    }

    #[test]
    fn client_accepts_a_preset_name() {
        let cli = Cli::parse_from(["chat", "client", "--server", "127.0.0.1:4000", "--name", "Ivan"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };

        assert_eq!(args.server, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(args.name.as_deref(), Some("Ivan"));
    }
}

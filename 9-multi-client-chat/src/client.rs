use std::thread;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::{Mutex, mpsc},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{self, DEFAULT_MAX_LINE_BYTES, read_line, write_line},
};

/// Marker printed whenever the client is waiting for local input.
pub const INPUT_MARKER: &str = ">>> ";

const EXIT_COMMANDS: &[&str] = &["exit", "quit", "выход"];
const SEPARATOR: &str = "--------------------------------------------------";

/// Terminal output shared by the inbound and outbound loops.
///
/// Every write goes out whole and flushed under one lock, so a message
/// printed by the inbound loop never splits the input marker of the other.
pub struct Console<W> {
    out: Mutex<W>,
}

impl<W> Console<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub async fn write(&self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.flush().await
    }

    pub async fn line(&self, text: &str) -> io::Result<()> {
        self.write(&format!("{text}\n")).await
    }

    /// Prints a line received from the server over the pending input marker.
    pub async fn notify(&self, text: &str) -> io::Result<()> {
        self.write(&format!("\r{text}\n{INPUT_MARKER}")).await
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = match TcpStream::connect(args.server).await {
        Ok(stream) => stream,
        Err(err) => {
            write_stderr(&format!("!!! could not connect to {}: {err}", args.server)).await?;
            write_stderr("!!! make sure the chat server is running").await?;
            return Ok(());
        }
    };
    info!("connected to {}", args.server);

    let console = Console::new(tokio::io::stdout());
    console
        .line(&format!("*** connected to {}", args.server))
        .await?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut input = spawn_stdin_reader();

    let joined = join_chat(
        &mut reader,
        &mut writer,
        &mut input,
        &console,
        args.name.as_deref(),
    )
    .await?;
    if joined {
        run_chat(&mut reader, &mut writer, &mut input, &console).await;
    }

    shutdown_connection(&mut writer).await;
    console.line("*** disconnected from server").await?;
    Ok(())
}

/// Reads stdin lines on a detached OS thread.
///
/// A blocking stdin read cannot be cancelled, so it must not live on the
/// runtime: the client has to exit while a read is still pending when the
/// server hangs up first.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        use std::io::BufRead;

        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!(?error, "failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Performs the handshake: answers the name prompt and prints the welcome.
///
/// Returns `false` when the server hung up or refused us before welcoming us.
pub async fn join_chat<R, W, O>(
    reader: &mut R,
    writer: &mut W,
    input: &mut mpsc::Receiver<String>,
    console: &Console<O>,
    preset_name: Option<&str>,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let Some(prompt) = read_line(reader, DEFAULT_MAX_LINE_BYTES).await? else {
        console.line("*** server closed the connection").await?;
        return Ok(false);
    };

    let name = match preset_name {
        Some(name) => name.to_string(),
        None => {
            console.write(&prompt).await?;
            input.recv().await.unwrap_or_default()
        }
    };
    write_line(writer, name.trim_end_matches(['\r', '\n'])).await?;

    let Some(welcome) = read_line(reader, DEFAULT_MAX_LINE_BYTES).await? else {
        console.line("*** server closed the connection").await?;
        return Ok(false);
    };
    if protocol::is_chat_full(&welcome) {
        console.line(&welcome).await?;
        return Ok(false);
    }

    console.line(&welcome).await?;
    console.line(SEPARATOR).await?;
    console
        .line("Commands: 'exit', 'quit', 'выход' - leave the chat")
        .await?;
    console.line(SEPARATOR).await?;

    Ok(true)
}

async fn run_chat<R, W, O>(
    reader: &mut R,
    writer: &mut W,
    input: &mut mpsc::Receiver<String>,
    console: &Console<O>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    select! {
        inbound = pump_inbound(reader, console) => {
            if let Err(error) = inbound {
                warn!(?error, "lost connection to server");
            }
        }
        outbound = pump_outbound(input, writer, console) => {
            if let Err(error) = outbound {
                warn!(?error, "failed to send message");
            }
        }
        ctrl_c = tokio::signal::ctrl_c() => handle_ctrl_c(ctrl_c),
    }
}

/// Prints everything the server sends until it closes the connection.
pub async fn pump_inbound<R, O>(reader: &mut R, console: &Console<O>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    while let Some(line) = read_line(reader, DEFAULT_MAX_LINE_BYTES).await? {
        console.notify(&line).await?;
    }
    console.write("\r*** server closed the connection\n").await?;
    Ok(())
}

/// Sends local input lines until an exit command or end of input.
pub async fn pump_outbound<W, O>(
    input: &mut mpsc::Receiver<String>,
    writer: &mut W,
    console: &Console<O>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        console.write(INPUT_MARKER).await?;
        let Some(line) = input.recv().await else {
            return Ok(());
        };

        let text = line.trim_end_matches(['\r', '\n']);
        if is_exit_command(text) {
            console.line("Disconnecting from chat...").await?;
            return Ok(());
        }
        if text.trim().is_empty() {
            continue;
        }

        write_line(writer, text).await?;
    }
}

pub fn is_exit_command(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    EXIT_COMMANDS.contains(&lowered.as_str())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(console: Console<Vec<u8>>) -> String {
        String::from_utf8(console.into_inner()).expect("console output is utf-8")
    }

    /// Input that yields `lines` and then reports end of input.
    fn typed(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line.to_string()).expect("room for every line");
        }
        rx
    }

    #[test]
    fn exit_commands_are_case_insensitive() {
        assert!(is_exit_command("exit"));
        assert!(is_exit_command("QUIT"));
        assert!(is_exit_command("Выход"));
        assert!(is_exit_command(" exit "));
        assert!(!is_exit_command("exit now"));
        assert!(!is_exit_command("hello"));
    }

    #[tokio::test]
    async fn exit_is_never_sent_to_the_server() {
        let mut input = typed(&["hello", "exit", "after exit"]);
        let mut sent = Vec::new();
        let console = Console::new(Vec::new());

        pump_outbound(&mut input, &mut sent, &console)
            .await
            .expect("outbound loop");

        assert_eq!(sent, b"hello\n");
        assert!(output(console).contains("Disconnecting from chat..."));
    }

    #[tokio::test]
    async fn blank_input_lines_are_skipped() {
        let mut input = typed(&["", "   \r", "hi there"]);
        let mut sent = Vec::new();
        let console = Console::new(Vec::new());

        pump_outbound(&mut input, &mut sent, &console)
            .await
            .expect("outbound loop");

        assert_eq!(sent, b"hi there\n");
    }

    #[tokio::test]
    async fn inbound_lines_restore_the_input_marker() {
        let mut reader: &[u8] = b"Ivan: hello\n[Server] Ivan left the chat.\n";
        let console = Console::new(Vec::new());

        pump_inbound(&mut reader, &console).await.expect("inbound loop");

        assert_eq!(
            output(console),
            "\rIvan: hello\n>>> \r[Server] Ivan left the chat.\n>>> \r*** server closed the connection\n"
        );
    }

    #[tokio::test]
    async fn handshake_with_preset_name() {
        let mut reader: &[u8] = "Введите ваше имя: \nWelcome to the chat, Ivan! Users online: 1\n".as_bytes();
        let mut sent = Vec::new();
        let mut input = typed(&[]);
        let console = Console::new(Vec::new());

        let joined = join_chat(&mut reader, &mut sent, &mut input, &console, Some("Ivan"))
            .await
            .expect("handshake");

        assert!(joined);
        assert_eq!(sent, b"Ivan\n");
        let printed = output(console);
        assert!(printed.contains("Welcome to the chat, Ivan! Users online: 1"));
        assert!(!printed.contains("Введите ваше имя"));
    }

    #[tokio::test]
    async fn handshake_prompts_for_a_name() {
        let mut reader: &[u8] = "Введите ваше имя: \nWelcome to the chat, Maria! Users online: 2\n".as_bytes();
        let mut sent = Vec::new();
        let mut input = typed(&["Maria"]);
        let console = Console::new(Vec::new());

        let joined = join_chat(&mut reader, &mut sent, &mut input, &console, None)
            .await
            .expect("handshake");

        assert!(joined);
        assert_eq!(sent, b"Maria\n");
        assert!(output(console).starts_with("Введите ваше имя: Welcome to the chat, Maria!"));
    }

    #[tokio::test]
    async fn handshake_reports_an_early_hangup() {
        let mut reader: &[u8] = "Введите ваше имя: \n".as_bytes();
        let mut sent = Vec::new();
        let mut input = typed(&[]);
        let console = Console::new(Vec::new());

        let joined = join_chat(&mut reader, &mut sent, &mut input, &console, Some("Ivan"))
            .await
            .expect("handshake");

        assert!(!joined);
        assert!(output(console).contains("*** server closed the connection"));
    }

    #[tokio::test]
    async fn handshake_stops_when_the_chat_is_full() {
        let mut reader: &[u8] =
            "Введите ваше имя: \n[Server] The chat is full (1 users). Try again later.\n".as_bytes();
        let mut sent = Vec::new();
        let mut input = typed(&[]);
        let console = Console::new(Vec::new());

        let joined = join_chat(&mut reader, &mut sent, &mut input, &console, Some("Maria"))
            .await
            .expect("handshake");

        assert!(!joined);
        let printed = output(console);
        assert!(printed.contains("The chat is full"));
        assert!(!printed.contains("Commands:"));
    }
}

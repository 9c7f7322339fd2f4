use crate::client::Client;
use crate::config::Config;
use crate::error::{BrokerError, FatalReason};
use crate::ledger::LedgerStore;
use crate::protocol;
use crate::slab::Slab;

use mio::net::{TcpListener, TcpStream};
use mio::{Event, Events, Poll, PollOpt, Ready, Token};
use slog::Logger;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_KIND_SERVER: usize = 0x00;
const TOKEN_KIND_CLIENT: usize = 0x01;
const TOKEN_INDEX_MASK: usize = 0x00ff_ffff;

const SERVER_TOKEN: Token = Token(TOKEN_KIND_SERVER << 24);

const INITIAL_CLIENT_CAPACITY: usize = 8;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

fn make_token(kind: usize, index: usize) -> Token {
    Token((kind << 24) | (index & TOKEN_INDEX_MASK))
}

fn token_kind(token: Token) -> usize {
    token.0 >> 24
}

fn token_index(token: Token) -> usize {
    token.0 & TOKEN_INDEX_MASK
}

/// Ignores `SIGPIPE` process-wide so that writing to a peer that has already closed its
/// read side surfaces as a normal `EPIPE` write error instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Owns the reactor: the listen socket, the client and ledger slabs, and the periodic
/// timer. `mio` 0.6 has no portable timer source, so the "timer" event from the
/// original design is reimplemented as a wall-clock check performed once per readiness
/// batch rather than a registered file descriptor. See DESIGN.md.
pub struct App {
    poll: Poll,
    listener: Option<TcpListener>,
    clients: Slab<Client<TcpStream>>,
    ledgers: LedgerStore,
    log: Logger,
    shutdown: Arc<AtomicBool>,
    last_tick: Instant,
}

impl App {
    pub fn init(config: &Config, log: Logger) -> Result<App, BrokerError> {
        std::fs::create_dir_all(&config.data_dir)?;
        set_mode(&config.data_dir, 0o755)?;

        let ledgers = LedgerStore::new(&config.data_dir, log.new(slog::o!("component" => "ledger")))?;
        let poll = Poll::new()?;

        Ok(App {
            poll,
            listener: None,
            clients: Slab::with_capacity(INITIAL_CLIENT_CAPACITY),
            ledgers,
            log,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_tick: Instant::now(),
        })
    }

    /// A clone of the shutdown flag. The caller (the `ledgerd` binary) installs
    /// `SIGINT`/`SIGTERM` handlers that set it; this crate never touches signal
    /// handling itself, matching spec's "signal installation" being an external
    /// collaborator concern.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn listen(&mut self, host: &str, port: u16) -> Result<(), BrokerError> {
        let mut last_err = None;

        for addr in (host, port).to_socket_addrs()? {
            match TcpListener::bind(&addr) {
                Ok(listener) => {
                    self.poll.register(&listener, SERVER_TOKEN, Ready::readable(), PollOpt::edge())?;
                    slog::info!(self.log, "listening"; "addr" => %addr);
                    self.listener = Some(listener);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err
            .map(BrokerError::Io)
            .unwrap_or_else(|| BrokerError::Config(format!("could not resolve {}:{}", host, port))))
    }

    pub fn run(&mut self) -> Result<(), BrokerError> {
        let mut events = Events::with_capacity(1024);
        self.last_tick = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.poll.poll(&mut events, Some(TICK_INTERVAL))?;

            for event in events.iter() {
                self.dispatch(event);
            }

            if self.last_tick.elapsed() >= TICK_INTERVAL {
                protocol::on_timer(&mut self.clients, &mut self.ledgers);
                self.last_tick = Instant::now();
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let token = event.token();

        match token_kind(token) {
            TOKEN_KIND_SERVER => self.accept_loop(),
            TOKEN_KIND_CLIENT => {
                let id = token_index(token);
                if !self.clients.contains(id) {
                    return;
                }

                let readiness = event.readiness();
                if readiness.is_readable() {
                    protocol::on_readable(&mut self.clients, &mut self.ledgers, id);
                }
                if self.clients.contains(id) && readiness.is_writable() {
                    protocol::on_writable(&mut self.clients, &mut self.ledgers, id);
                }
            }
            _ => {}
        }
    }

    fn accept_loop(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };

            let (socket, addr) = match accepted {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    slog::warn!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            };

            if let Err(err) = socket.set_nodelay(true) {
                slog::warn!(self.log, "set_nodelay failed"; "error" => %err);
            }

            let client_log = self.log.new(slog::o!("peer" => addr.to_string()));
            let id = self.clients.insert(Client::new(0, socket, client_log));
            self.clients.get_mut(id).expect("just inserted").id = id;

            let token = make_token(TOKEN_KIND_CLIENT, id);
            let register_result = self.poll.register(
                &self.clients.get(id).expect("just inserted").socket,
                token,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            );

            if let Err(err) = register_result {
                slog::warn!(self.log, "register failed"; "error" => %err);
                self.clients.remove(id);
                continue;
            }

            slog::debug!(self.log, "accepted"; "client_id" => id);
            protocol::on_readable(&mut self.clients, &mut self.ledgers, id);
        }
    }

    /// Disconnects every live client and closes every open ledger. Called once the
    /// readiness loop has exited.
    pub fn quit(&mut self) {
        let ids: Vec<usize> = self.clients.iter().map(|(i, _)| i).collect();
        for id in ids {
            protocol::disconnect(&mut self.clients, &mut self.ledgers, id, FatalReason::ServerShutdown);
        }
        self.ledgers.close_all();
        slog::info!(self.log, "shutting down");
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_kind_and_index() {
        let token = make_token(TOKEN_KIND_CLIENT, 42);
        assert_eq!(token_kind(token), TOKEN_KIND_CLIENT);
        assert_eq!(token_index(token), 42);
    }

    #[test]
    fn server_token_has_index_zero() {
        assert_eq!(token_kind(SERVER_TOKEN), TOKEN_KIND_SERVER);
        assert_eq!(token_index(SERVER_TOKEN), 0);
    }

    #[test]
    fn init_creates_data_and_ledgers_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { data_dir: dir.path().to_path_buf(), ..Config::default() };
        let app = App::init(&config, crate::logging::discard()).unwrap();
        drop(app);
        assert!(dir.path().join("ledgers").is_dir());
    }
}

use crate::client::{Client, State};
use crate::entry::{Header, HEADER_SIZE, MAX_PAYLOAD};
use crate::error::{BrokerError, FatalReason, NetError, NetResult};
use crate::ledger::{LedgerStore, Uuid};
use crate::slab::Slab;

use std::io::{Read, Write};

const MAGIC_V0: &[u8; 5] = b"OoTMM";
const MAGIC_V2: &[u8; 5] = b"OOMM2";

const OP_NONE: u8 = 0x00;
const OP_TRANSFER: u8 = 0x01;

/// Drives the client at `id` through as much of the state machine as currently
/// buffered (or freshly read) data allows, after an `EventInput` readiness
/// notification: `FlushIn` followed by state-machine processing. Any fatal error
/// invalidates the slot; `Wait` (not enough data yet) is swallowed here, and the reactor
/// simply calls back in on the next readable event.
pub fn on_readable<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, id: usize) {
    let result = (|| -> NetResult<()> {
        clients
            .get_mut(id)
            .expect("on_readable called on unknown client id")
            .flush_in()?;
        process(clients, ledgers, id)
    })();

    finish(clients, ledgers, id, result);
}

/// `EventOutput`: `FlushOut`, then resume streaming ledger catch-up if the client has
/// reached `Ready`.
pub fn on_writable<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, id: usize) {
    let result = (|| -> NetResult<()> {
        clients
            .get_mut(id)
            .expect("on_writable called on unknown client id")
            .flush_out()?;

        if clients.get(id).expect("client id must still be valid").state == State::Ready {
            transfer_ledger(clients, ledgers, id)?;
        }
        Ok(())
    })();

    finish(clients, ledgers, id, result);
}

/// `EventTimer`: advance every client's timeout counters, emit keepalives, and
/// disconnect anyone who has gone quiet for too long.
pub fn on_timer<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore) {
    let ids: Vec<usize> = clients.iter().map(|(i, _)| i).collect();

    for id in ids {
        let tick = match clients.get_mut(id) {
            Some(client) => client.tick(),
            None => continue,
        };

        if tick.send_keepalive {
            let result = clients.get_mut(id).expect("id just ticked").write(&[OP_NONE]);
            if let Err(NetError::Fatal(reason)) = result {
                disconnect(clients, ledgers, id, reason);
                continue;
            }
        }

        if tick.rx_timed_out {
            if let Some(client) = clients.get(id) {
                slog::warn!(client.log, "rx timeout");
            }
            disconnect(clients, ledgers, id, FatalReason::RxTimeout);
        }
    }
}

/// Invalidates a client slot: logs the reason, releases its ledger reference (if any),
/// and frees the slab slot for reuse.
pub fn disconnect<S: Read + Write>(
    clients: &mut Slab<Client<S>>,
    ledgers: &mut LedgerStore,
    id: usize,
    reason: FatalReason,
) {
    if let Some(client) = clients.get(id) {
        slog::debug!(client.log, "disconnecting"; "reason" => %reason);
    }

    if let Some(client) = clients.remove(id) {
        if let Some(ledger_id) = client.ledger_id {
            ledgers.release(ledger_id);
        }
    }
}

fn finish<S: Read + Write>(
    clients: &mut Slab<Client<S>>,
    ledgers: &mut LedgerStore,
    id: usize,
    result: NetResult<()>,
) {
    match result {
        Ok(()) | Err(NetError::Wait) => {}
        Err(NetError::Fatal(reason)) => disconnect(clients, ledgers, id, reason),
    }
}

fn process<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, id: usize) -> NetResult<()> {
    loop {
        let state = clients.get(id).expect("client id must still be valid").state;
        match state {
            State::New => handle_new(clients.get_mut(id).expect("client id must still be valid"))?,
            State::Connected => handle_connected(clients, ledgers, id)?,
            State::Ready => handle_ready(clients, ledgers, id)?,
        }
    }
}

fn handle_new<S: Read + Write>(client: &mut Client<S>) -> NetResult<()> {
    let mut magic = [0u8; 5];
    client.peek(&mut magic)?;

    if &magic == MAGIC_V2 {
        let mut full = [0u8; 9];
        client.read(&mut full)?;
        let version = u32::from_le_bytes([full[5], full[6], full[7], full[8]]);
        client.version = version;

        let mut reply = [0u8; 11];
        reply[..5].copy_from_slice(MAGIC_V2);
        reply[5..9].copy_from_slice(&version.to_le_bytes());
        reply[9..11].copy_from_slice(&(client.id as u16).to_le_bytes());
        client.write(&reply)?;

        client.state = State::Connected;
        Ok(())
    } else if &magic == MAGIC_V0 {
        let mut full = [0u8; 5];
        client.read(&mut full)?;
        client.version = 0;
        client.write(MAGIC_V0)?;

        client.state = State::Connected;
        Ok(())
    } else {
        slog::warn!(client.log, "bad handshake magic");
        Err(NetError::Fatal(FatalReason::BadHandshake))
    }
}

fn handle_connected<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, id: usize) -> NetResult<()> {
    let mut join = [0u8; 20];
    clients.get_mut(id).expect("client id must still be valid").read(&mut join)?;

    let mut uuid: Uuid = [0u8; 16];
    uuid.copy_from_slice(&join[..16]);
    let ledger_base = u32::from_le_bytes([join[16], join[17], join[18], join[19]]);

    let ledger_id = ledgers.open(uuid).map_err(|err| match err {
        BrokerError::Config(_) => NetError::Fatal(FatalReason::LedgerCorrupt),
        _ => NetError::Fatal(FatalReason::LedgerIo),
    })?;

    if ledger_base as usize > ledgers.get(ledger_id).expect("just opened").count() {
        ledgers.release(ledger_id);
        return Err(NetError::Fatal(FatalReason::BaseAheadOfLedger));
    }

    {
        let client = clients.get_mut(id).expect("client id must still be valid");
        client.ledger_id = Some(ledger_id);
        client.ledger_base = ledger_base;
        client.state = State::Ready;
    }

    transfer_ledger(clients, ledgers, id)
}

fn handle_ready<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, id: usize) -> NetResult<()> {
    let op = {
        let client = clients.get_mut(id).expect("client id must still be valid");
        if client.op == 0 {
            let mut byte = [0u8; 1];
            client.read(&mut byte)?;
            client.op = byte[0];
        }
        client.op
    };

    match op {
        OP_TRANSFER => cmd_transfer(clients, ledgers, id),
        _ => Err(NetError::Fatal(FatalReason::UnknownOp)),
    }
}

fn cmd_transfer<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, id: usize) -> NetResult<()> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    clients.get_mut(id).expect("client id must still be valid").peek(&mut header_bytes)?;

    let header = Header::decode(&header_bytes);
    if header.size as usize > MAX_PAYLOAD {
        return Err(NetError::Fatal(FatalReason::OversizeTransfer));
    }

    let total = HEADER_SIZE + header.size as usize;
    let mut frame = [0u8; HEADER_SIZE + MAX_PAYLOAD];
    clients.get_mut(id).expect("client id must still be valid").read(&mut frame[..total])?;

    if header.key == 0 {
        return Err(NetError::Fatal(FatalReason::InvalidKey));
    }

    let ledger_id = clients
        .get(id)
        .expect("client id must still be valid")
        .ledger_id
        .expect("Ready state implies a joined ledger");

    if ledgers.write(ledger_id, header.key, &frame[HEADER_SIZE..total]).is_err() {
        disconnect_ledger_members(clients, ledgers, ledger_id, id, FatalReason::LedgerIo);
        return Err(NetError::Fatal(FatalReason::LedgerIo));
    }

    clients.get_mut(id).expect("client id must still be valid").op = 0;

    fanout(clients, ledgers, ledger_id);
    Ok(())
}

/// A fatal ledger write failure closes the ledger slot out from under every client
/// still joined to it. Disconnects all of them except `except_id`, whose own fatal
/// error the caller is already propagating through the normal `finish` path.
fn disconnect_ledger_members<S: Read + Write>(
    clients: &mut Slab<Client<S>>,
    ledgers: &mut LedgerStore,
    ledger_id: usize,
    except_id: usize,
    reason: FatalReason,
) {
    let ids: Vec<usize> = clients
        .iter()
        .filter(|(i, c)| *i != except_id && c.ledger_id == Some(ledger_id))
        .map(|(i, _)| i)
        .collect();

    for cid in ids {
        disconnect(clients, ledgers, cid, reason);
    }
}

/// Streams every entry from `client.ledger_base` up to the ledger's current count into
/// that client's tx buffer, advancing the cursor one entry at a time. Stops (without
/// advancing further) on tx backpressure, resuming from the next `EventOutput`.
fn transfer_ledger<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &LedgerStore, id: usize) -> NetResult<()> {
    loop {
        let (ledger_id, base) = {
            let client = clients.get(id).expect("client id must still be valid");
            match client.ledger_id {
                Some(ledger_id) => (ledger_id, client.ledger_base),
                None => return Ok(()),
            }
        };

        let ledger = match ledgers.get(ledger_id) {
            Some(ledger) => ledger,
            None => return Err(NetError::Fatal(FatalReason::LedgerIo)),
        };
        if base as usize >= ledger.count() {
            return Ok(());
        }

        let mut entry_buf = [0u8; HEADER_SIZE + MAX_PAYLOAD];
        let (_header, len) = ledger
            .read_entry(base as usize, &mut entry_buf)
            .map_err(|_| NetError::Fatal(FatalReason::LedgerIo))?;

        let mut frame = [0u8; 1 + HEADER_SIZE + MAX_PAYLOAD];
        frame[0] = OP_TRANSFER;
        frame[1..1 + len].copy_from_slice(&entry_buf[..len]);

        let client = clients.get_mut(id).expect("client id must still be valid");
        match client.write(&frame[..1 + len]) {
            Ok(()) => client.ledger_base += 1,
            Err(NetError::Fatal(FatalReason::BufferSaturated)) => return Ok(()),
            Err(other) => return Err(other),
        }
    }
}

/// Calls `transfer_ledger` on every client currently joined to `ledger_id`, including
/// the client that just wrote the triggering entry (harmless: its cursor is already
/// past the new entry). Any client whose stream fails fatally is disconnected without
/// aborting the fan-out for the rest.
fn fanout<S: Read + Write>(clients: &mut Slab<Client<S>>, ledgers: &mut LedgerStore, ledger_id: usize) {
    let ids: Vec<usize> = clients
        .iter()
        .filter(|(_, c)| c.ledger_id == Some(ledger_id))
        .map(|(i, _)| i)
        .collect();

    for cid in ids {
        if let Err(NetError::Fatal(reason)) = transfer_ledger(clients, ledgers, cid) {
            disconnect(clients, ledgers, cid, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use slog::Logger;
    use std::collections::VecDeque;
    use std::io;
    use tempfile::tempdir;

    struct MockSocket {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl MockSocket {
        fn new() -> MockSocket {
            MockSocket { inbound: VecDeque::new(), outbound: Vec::new() }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.inbound.extend(bytes.iter().copied());
        }
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_log() -> Logger {
        logging::discard()
    }

    fn join_frame(uuid: [u8; 16], base: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(20);
        frame.extend_from_slice(&uuid);
        frame.extend_from_slice(&base.to_le_bytes());
        frame
    }

    fn transfer_frame(key: u64, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + HEADER_SIZE + payload.len());
        frame.push(OP_TRANSFER);
        frame.extend_from_slice(&key.to_le_bytes());
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn v0_handshake_then_join_with_empty_ledger() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut socket = MockSocket::new();
        socket.feed(MAGIC_V0);
        socket.feed(&join_frame([0u8; 16], 0));
        let id = clients.insert(Client::new(0, socket, test_log()));

        on_readable(&mut clients, &mut ledgers, id);

        let client = clients.get(id).unwrap();
        assert_eq!(client.state, State::Ready);
        assert_eq!(client.socket.outbound, MAGIC_V0);
    }

    #[test]
    fn v2_handshake_replies_with_version_and_client_id() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut socket = MockSocket::new();
        socket.feed(MAGIC_V2);
        socket.feed(&7u32.to_le_bytes());
        let id = clients.insert(Client::new(3, socket, test_log()));

        on_readable(&mut clients, &mut ledgers, id);

        let client = clients.get(id).unwrap();
        assert_eq!(client.version, 7);
        let mut expected = Vec::new();
        expected.extend_from_slice(MAGIC_V2);
        expected.extend_from_slice(&7u32.to_le_bytes());
        expected.extend_from_slice(&3u16.to_le_bytes());
        assert_eq!(client.socket.outbound, expected);
    }

    #[test]
    fn bad_magic_invalidates_client() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut socket = MockSocket::new();
        socket.feed(b"xxxxx");
        let id = clients.insert(Client::new(0, socket, test_log()));

        on_readable(&mut clients, &mut ledgers, id);
        assert!(clients.get(id).is_none());
    }

    #[test]
    fn submit_entry_and_self_replay() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut socket = MockSocket::new();
        socket.feed(MAGIC_V0);
        socket.feed(&join_frame([0u8; 16], 0));
        socket.feed(&transfer_frame(1, b"abc"));
        let id = clients.insert(Client::new(0, socket, test_log()));

        on_readable(&mut clients, &mut ledgers, id);

        let client = clients.get(id).unwrap();
        let mut expected = MAGIC_V0.to_vec();
        expected.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(client.socket.outbound, expected);
        assert_eq!(client.ledger_base, 1);
    }

    #[test]
    fn dedup_across_two_clients() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut s1 = MockSocket::new();
        s1.feed(MAGIC_V0);
        s1.feed(&join_frame([0u8; 16], 0));
        let id1 = clients.insert(Client::new(0, s1, test_log()));
        on_readable(&mut clients, &mut ledgers, id1);

        let mut s2 = MockSocket::new();
        s2.feed(MAGIC_V0);
        s2.feed(&join_frame([0u8; 16], 0));
        let id2 = clients.insert(Client::new(1, s2, test_log()));
        on_readable(&mut clients, &mut ledgers, id2);

        clients.get_mut(id1).unwrap().socket.feed(&transfer_frame(7, b"x"));
        on_readable(&mut clients, &mut ledgers, id1);

        clients.get_mut(id2).unwrap().socket.feed(&transfer_frame(7, b"x"));
        on_readable(&mut clients, &mut ledgers, id2);

        let ledger_id = clients.get(id1).unwrap().ledger_id.unwrap();
        assert_eq!(ledgers.get(ledger_id).unwrap().count(), 1);
    }

    #[test]
    fn oversize_transfer_is_rejected() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut socket = MockSocket::new();
        socket.feed(MAGIC_V0);
        socket.feed(&join_frame([0u8; 16], 0));
        let mut bad = vec![OP_TRANSFER];
        bad.extend_from_slice(&1u64.to_le_bytes());
        bad.push(200u8);
        socket.feed(&bad);
        let id = clients.insert(Client::new(0, socket, test_log()));

        on_readable(&mut clients, &mut ledgers, id);
        assert!(clients.get(id).is_none());
    }

    #[test]
    fn base_ahead_of_ledger_is_rejected() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut socket = MockSocket::new();
        socket.feed(MAGIC_V0);
        socket.feed(&join_frame([0u8; 16], 5));
        let id = clients.insert(Client::new(0, socket, test_log()));

        on_readable(&mut clients, &mut ledgers, id);
        assert!(clients.get(id).is_none());
    }

    #[test]
    fn catch_up_streams_only_entries_past_base() {
        let dir = tempdir().unwrap();
        let mut ledgers = LedgerStore::new(dir.path(), test_log()).unwrap();
        let mut clients: Slab<Client<MockSocket>> = Slab::new();

        let mut writer_socket = MockSocket::new();
        writer_socket.feed(MAGIC_V0);
        writer_socket.feed(&join_frame([0u8; 16], 0));
        for key in 1..=5u64 {
            writer_socket.feed(&transfer_frame(key, b"e"));
        }
        let writer = clients.insert(Client::new(0, writer_socket, test_log()));
        on_readable(&mut clients, &mut ledgers, writer);

        let mut reader_socket = MockSocket::new();
        reader_socket.feed(MAGIC_V0);
        reader_socket.feed(&join_frame([0u8; 16], 2));
        let reader = clients.insert(Client::new(1, reader_socket, test_log()));
        on_readable(&mut clients, &mut ledgers, reader);

        let client = clients.get(reader).unwrap();
        assert_eq!(client.ledger_base, 5);
        let mut expected = MAGIC_V0.to_vec();
        for key in 3..=5u64 {
            expected.extend_from_slice(&transfer_frame(key, b"e"));
        }
        assert_eq!(client.socket.outbound, expected);
    }
}

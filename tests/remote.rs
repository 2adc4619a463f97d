//! Two daemons talking over a real socket pair: one masters a volume,
//! the other reaches it remotely. Exercises the auth handshake, operation
//! forwarding, capability pass-through and the lookup-revalidation /
//! forget flow.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use zlomekfs::config::Config;
use zlomekfs::dispatch::{handle_frame, RequestSource};
use zlomekfs::network::{reader_loop, PeerConn};
use zlomekfs::ops;
use zlomekfs::proto::{ConnectionSpeed, Opcode, Sattr};
use zlomekfs::{Runtime, ZfsError};

struct Cluster {
    _master_dir: tempfile::TempDir,
    master: Arc<Runtime>,
    client: Arc<Runtime>,
    client_conn: Arc<PeerConn>,
    readers: Vec<std::thread::JoinHandle<()>>,
}

impl Cluster {
    /// Master `orion` (node 1) exports volume 5; client `vega` (node 2)
    /// sees it as a purely remote volume.
    fn start() -> Cluster {
        let master_dir = tempfile::tempdir().unwrap();
        let master_config = format!(
            "nodeid 1\nnodename orion\nnode 2 vega localhost\n\
             volume 5 home /home 1 {}\n",
            master_dir.path().display()
        );
        let master = Runtime::new(Config::parse(&master_config).unwrap()).unwrap();

        let client_config = "nodeid 2\nnodename vega\nnode 1 orion localhost\n\
             volume 5 home /home 1\n";
        let client = Runtime::new(Config::parse(client_config).unwrap()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client_stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (master_stream, _) = listener.accept().unwrap();

        let master_conn = PeerConn::new(master_stream).unwrap();
        let client_conn = PeerConn::new(client_stream).unwrap();

        let mut readers = Vec::new();
        {
            // Master side: incoming frames are requests from the client.
            let rt = master.clone();
            let conn = master_conn.clone();
            readers.push(std::thread::spawn(move || {
                reader_loop(conn, 1, move |conn, frame| {
                    if let Some(reply) = handle_frame(&rt, RequestSource::Peer(&conn), &frame) {
                        let _ = conn.send_frame(&reply);
                    }
                });
            }));
        }
        {
            let rt = client.clone();
            let conn = client_conn.clone();
            readers.push(std::thread::spawn(move || {
                reader_loop(conn, 2, move |conn, frame| {
                    if let Some(reply) = handle_frame(&rt, RequestSource::Peer(&conn), &frame) {
                        let _ = conn.send_frame(&reply);
                    }
                });
            }));
        }

        // Two-stage handshake, client side.
        let reply = client_conn
            .call(Opcode::AuthStage1, 2, |dc| dc.encode_str(b"vega"))
            .unwrap();
        let mut r = reply.reader().unwrap();
        assert_eq!(
            zlomekfs::proto::decode_nodename(&mut r).unwrap(),
            b"orion"
        );
        client_conn.set_stage1("orion", 1);
        client_conn
            .call(Opcode::AuthStage2, 2, |dc| ConnectionSpeed::Fast.encode(dc))
            .unwrap();
        client_conn.set_stage2(ConnectionSpeed::Fast);
        client
            .nodes
            .by_name("orion")
            .unwrap()
            .set_conn(client_conn.clone());

        Cluster {
            _master_dir: master_dir,
            master,
            client,
            client_conn,
            readers,
        }
    }

    fn stop(self) {
        self.client_conn.teardown(ZfsError::Exiting);
        for reader in self.readers {
            let _ = reader.join();
        }
    }
}

#[test]
fn remote_volume_end_to_end() {
    let cluster = Cluster::start();
    let client = &cluster.client;
    let master = &cluster.master;

    // The client resolves the volume root through the master.
    let root = ops::volume_root(client, 5).unwrap();
    assert_eq!(root.file.sid, 1);

    // mkdir lands on the master's disk.
    let sub = ops::mkdir(client, &root.file, b"sub", &Sattr::default()).unwrap();
    assert!(cluster._master_dir.path().join("sub").is_dir());

    // create/write/read pass the master-issued capability through.
    let created = ops::create(
        client,
        &sub.file,
        b"data",
        libc::O_RDWR as u32,
        &Sattr::default(),
    )
    .unwrap();
    let wrote = ops::write(client, &created.cap, 0, b"over the wire").unwrap();
    assert_eq!(wrote, 13);
    let got = ops::read(client, &created.cap, 5, 8).unwrap();
    assert_eq!(got, b"the wire");

    let info = ops::file_info(client, &created.file).unwrap();
    assert_eq!(info, b"/sub/data");

    ops::close(client, &created.cap).unwrap();

    // Forwarding was counted on the client, none originated on the master.
    assert!(client.rpc_count() > 0);
    assert_eq!(master.rpc_count(), 0);

    cluster.stop();
}

#[test]
fn lookup_revalidation_forgets_replaced_handle() {
    let cluster = Cluster::start();
    let client = &cluster.client;
    let master = &cluster.master;

    let root_c = ops::volume_root(client, 5).unwrap();
    let root_m = ops::volume_root(master, 5).unwrap();

    let created = ops::create(
        master,
        &root_m.file,
        b"f",
        libc::O_RDWR as u32,
        &Sattr::default(),
    )
    .unwrap();
    ops::close(master, &created.cap).unwrap();
    let f1 = created.file;

    // The client looks the file up and holds a dentry to F1.
    let seen = ops::lookup(client, &root_c.file, b"f").unwrap();
    assert_eq!(seen.file, f1);
    let master_count_before = master.tables.nlookup(&f1);
    assert!(master_count_before >= 1);

    // The master renames f to g and creates a fresh f.
    ops::rename(master, &root_m.file, b"f", &root_m.file, b"g").unwrap();
    let fresh = ops::create(
        master,
        &root_m.file,
        b"f",
        libc::O_RDWR as u32,
        &Sattr::default(),
    )
    .unwrap();
    ops::close(master, &fresh.cap).unwrap();
    let f2 = fresh.file;
    assert_ne!(f1, f2);

    // The client's next lookup sees the new handle, forgets the old one
    // and rebuilds its dentry.
    let seen = ops::lookup(client, &root_c.file, b"f").unwrap();
    assert_eq!(seen.file, f2);
    assert_eq!(client.tables.nlookup(&f1), 0);

    // The forget reached the master: its counter dropped by exactly the
    // client's balance. Give the one-way frame a moment to arrive.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while master.tables.nlookup(&f1) >= master_count_before
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(master.tables.nlookup(&f1) < master_count_before);

    cluster.stop();
}

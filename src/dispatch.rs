//! Request dispatch.
//!
//! Frames from both transports funnel through [`handle_frame`]: the
//! envelope is decoded, the opcode routed to its operation, the result
//! encoded into a reply frame. Unknown opcodes answer `ENOSYS`; frames
//! whose envelope cannot be parsed are dropped with a warning (they are
//! usually late replies whose waiter already gave up). Peer connections
//! must pass both auth stages before any data operation is accepted;
//! identities crossing a peer boundary are mapped through the node's
//! uid/gid tables.

use std::sync::Arc;

use log::{debug, warn};

use crate::codec::{CodecError, DataCoder, FrameReader};
use crate::network::PeerConn;
use crate::node::Node;
use crate::ops;
use crate::proto::{
    ConnectionSpeed, CreateArgs, DirOpArgs, Fattr, ForgetArgs, Md5SumArgs, MkdirArgs, MknodArgs,
    Opcode, OpenArgs, ReadArgs, ReadDirArgs, RenameArgs, RequestHeader, ReplyHeader, Sattr,
    SattrArgs, SetXattrArgs, SymlinkArgs, WriteArgs, XattrNameArgs, ZfsCap, ZfsError, ZfsFh,
    ZfsResult,
};
use crate::Runtime;

/// Where a request frame came from.
#[derive(Debug)]
pub enum RequestSource<'a> {
    /// The kernel channel; fully trusted, no identity mapping.
    Kernel,
    /// A peer connection.
    Peer(&'a Arc<PeerConn>),
}

impl RequestSource<'_> {
    fn peer(&self) -> Option<&Arc<PeerConn>> {
        match self {
            RequestSource::Peer(conn) => Some(conn),
            RequestSource::Kernel => None,
        }
    }
}

fn encode_reply(
    request_id: u32,
    error: i32,
    body: impl FnOnce(&mut DataCoder) -> Result<(), CodecError>,
) -> Vec<u8> {
    let mut dc = DataCoder::new();
    dc.start_encoding();
    let mut encoded = ReplyHeader { request_id, error }.encode(&mut dc).is_ok();
    if encoded && error == 0 {
        encoded = body(&mut dc).is_ok();
    }
    if !encoded {
        // The result did not fit; re-encode as a plain error.
        dc.start_encoding();
        let _ = ReplyHeader {
            request_id,
            error: ZfsError::FBig.to_wire(),
        }
        .encode(&mut dc);
    }
    dc.finish_encoding().to_vec()
}

fn reply_with<T>(
    request_id: u32,
    result: ZfsResult<T>,
    encode: impl FnOnce(&T, &mut DataCoder) -> Result<(), CodecError>,
) -> Option<Vec<u8>> {
    Some(match result {
        Ok(value) => encode_reply(request_id, 0, |dc| encode(&value, dc)),
        Err(err) => encode_reply(request_id, err.to_wire(), |_| Ok(())),
    })
}

fn reply_empty(request_id: u32, result: ZfsResult<()>) -> Option<Vec<u8>> {
    reply_with(request_id, result, |_, _| Ok(()))
}

/// The node behind an authenticated peer connection.
fn peer_node(rt: &Runtime, source: &RequestSource<'_>) -> Option<Arc<Node>> {
    let conn = source.peer()?;
    let node_id = conn.identity().node_id?;
    rt.nodes.by_id(node_id)
}

fn map_sattr_in(node: Option<&Arc<Node>>, sattr: &mut Sattr) {
    let Some(node) = node else { return };
    let state = node.lock_state();
    if sattr.uid != u32::MAX {
        sattr.uid = state.identities.uid_in(sattr.uid);
    }
    if sattr.gid != u32::MAX {
        sattr.gid = state.identities.gid_in(sattr.gid);
    }
}

fn map_attr_out(node: Option<&Arc<Node>>, attr: &mut Fattr) {
    let Some(node) = node else { return };
    let state = node.lock_state();
    attr.uid = state.identities.uid_out(attr.uid);
    attr.gid = state.identities.gid_out(attr.gid);
}

/// Handle one request frame; returns the encoded reply frame, or `None`
/// for one-way operations and undecodable envelopes.
pub fn handle_frame(
    rt: &Arc<Runtime>,
    source: RequestSource<'_>,
    frame: &[u8],
) -> Option<Vec<u8>> {
    let mut r = match FrameReader::new(frame) {
        Ok(r) => r,
        Err(err) => {
            warn!("dropping unparsable frame: {err}");
            return None;
        }
    };
    let header = match RequestHeader::decode(&mut r) {
        Ok(header) => header,
        Err(err) => {
            warn!("dropping frame with bad envelope: {err}");
            return None;
        }
    };
    let request_id = header.request_id;

    let opcode = match header.opcode() {
        Ok(opcode) => opcode,
        Err(_) => {
            debug!("unknown opcode {}", header.opcode);
            return reply_empty(request_id, Err(ZfsError::NoSys));
        }
    };

    // Both auth stages must complete before a peer may issue data ops.
    if let Some(conn) = source.peer() {
        let exempt = matches!(
            opcode,
            Opcode::AuthStage1 | Opcode::AuthStage2 | Opcode::Null | Opcode::Ping
        );
        if !exempt && !conn.is_authed() {
            warn!("peer issued {opcode:?} before completing auth");
            return reply_empty(request_id, Err(ZfsError::Access));
        }
    }

    if !rt.is_running() && opcode != Opcode::Forget {
        return reply_empty(request_id, Err(ZfsError::Exiting));
    }

    let node = peer_node(rt, &source);

    match opcode {
        Opcode::Null | Opcode::Ping => reply_empty(request_id, Ok(())),

        Opcode::AuthStage1 => {
            let Some(conn) = source.peer() else {
                return reply_empty(request_id, Err(ZfsError::Inval));
            };
            let name = match crate::proto::decode_nodename(&mut r) {
                Ok(name) => name,
                Err(_) => return reply_empty(request_id, Err(ZfsError::Inval)),
            };
            let Ok(name) = std::str::from_utf8(name) else {
                return reply_empty(request_id, Err(ZfsError::Access));
            };
            let Some(peer) = rt.nodes.by_name(name) else {
                warn!("auth from unknown node {name}");
                return reply_empty(request_id, Err(ZfsError::Access));
            };
            conn.set_stage1(name, peer.id);
            let ours = rt.this_node.name.clone();
            reply_with(request_id, Ok(ours), |name, dc| {
                dc.encode_str(name.as_bytes())
            })
        }

        Opcode::AuthStage2 => {
            let Some(conn) = source.peer() else {
                return reply_empty(request_id, Err(ZfsError::Inval));
            };
            if !conn.stage1_done() {
                return reply_empty(request_id, Err(ZfsError::Access));
            }
            let speed = match ConnectionSpeed::decode(&mut r) {
                Ok(speed) => speed,
                Err(_) => return reply_empty(request_id, Err(ZfsError::Inval)),
            };
            conn.set_stage2(speed);
            if let Some(node_id) = conn.identity().node_id {
                if let Some(peer) = rt.nodes.by_id(node_id) {
                    peer.lock_state().speed = speed;
                    peer.set_conn(conn.clone());
                }
            }
            reply_empty(request_id, Ok(()))
        }

        Opcode::Root => reply_with(request_id, ops::root(rt), |res, dc| {
            let mut res = *res;
            map_attr_out(node.as_ref(), &mut res.attr);
            res.encode(dc)
        }),

        Opcode::VolumeRoot => {
            let vid = match r.read_u32() {
                Ok(vid) => vid,
                Err(_) => return reply_empty(request_id, Err(ZfsError::Inval)),
            };
            reply_with(request_id, ops::volume_root(rt, vid), |res, dc| {
                let mut res = *res;
                map_attr_out(node.as_ref(), &mut res.attr);
                res.encode(dc)
            })
        }

        Opcode::GetAttr => match ZfsFh::decode(&mut r) {
            Ok(fh) => reply_with(request_id, ops::getattr(rt, &fh), |attr, dc| {
                let mut attr = *attr;
                map_attr_out(node.as_ref(), &mut attr);
                attr.encode(dc)
            }),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::SetAttr => match SattrArgs::decode(&mut r) {
            Ok(mut args) => {
                map_sattr_in(node.as_ref(), &mut args.attr);
                reply_with(
                    request_id,
                    ops::setattr(rt, &args.file, &args.attr),
                    |attr, dc| {
                        let mut attr = *attr;
                        map_attr_out(node.as_ref(), &mut attr);
                        attr.encode(dc)
                    },
                )
            }
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Lookup => match DirOpArgs::decode(&mut r) {
            Ok(args) => reply_with(
                request_id,
                ops::lookup(rt, &args.dir, args.name),
                |res, dc| {
                    let mut res = *res;
                    map_attr_out(node.as_ref(), &mut res.attr);
                    res.encode(dc)
                },
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Create => match CreateArgs::decode(&mut r) {
            Ok(mut args) => {
                map_sattr_in(node.as_ref(), &mut args.attr);
                reply_with(
                    request_id,
                    ops::create(
                        rt,
                        &args.location.dir,
                        args.location.name,
                        args.flags,
                        &args.attr,
                    ),
                    |res, dc| {
                        let mut res = *res;
                        map_attr_out(node.as_ref(), &mut res.attr);
                        res.encode(dc)
                    },
                )
            }
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Open => match OpenArgs::decode(&mut r) {
            Ok(args) => reply_with(
                request_id,
                ops::open(rt, &args.file, args.flags),
                |cap, dc| cap.encode(dc),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Close => match ZfsCap::decode(&mut r) {
            Ok(cap) => reply_empty(request_id, ops::close(rt, &cap)),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::ReadDir => match ReadDirArgs::decode(&mut r) {
            Ok(args) => reply_with(
                request_id,
                ops::readdir(rt, &args.cap, args.cookie, args.count),
                |list, dc| list.encode(dc),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Mkdir => match MkdirArgs::decode(&mut r) {
            Ok(mut args) => {
                map_sattr_in(node.as_ref(), &mut args.attr);
                reply_with(
                    request_id,
                    ops::mkdir(rt, &args.location.dir, args.location.name, &args.attr),
                    |res, dc| {
                        let mut res = *res;
                        map_attr_out(node.as_ref(), &mut res.attr);
                        res.encode(dc)
                    },
                )
            }
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Rmdir => match DirOpArgs::decode(&mut r) {
            Ok(args) => reply_empty(request_id, ops::rmdir(rt, &args.dir, args.name)),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Unlink => match DirOpArgs::decode(&mut r) {
            Ok(args) => reply_empty(request_id, ops::unlink(rt, &args.dir, args.name)),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Mknod => match MknodArgs::decode(&mut r) {
            Ok(mut args) => {
                map_sattr_in(node.as_ref(), &mut args.attr);
                reply_with(
                    request_id,
                    ops::mknod(
                        rt,
                        &args.location.dir,
                        args.location.name,
                        &args.attr,
                        args.ftype,
                        args.rdev,
                    ),
                    |res, dc| res.encode(dc),
                )
            }
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Link => match crate::proto::LinkArgs::decode(&mut r) {
            Ok(args) => reply_empty(
                request_id,
                ops::link(rt, &args.from, &args.to.dir, args.to.name),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Symlink => match SymlinkArgs::decode(&mut r) {
            Ok(mut args) => {
                map_sattr_in(node.as_ref(), &mut args.attr);
                reply_with(
                    request_id,
                    ops::symlink(rt, &args.from.dir, args.from.name, args.to, &args.attr),
                    |res, dc| res.encode(dc),
                )
            }
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::ReadLink => match ZfsFh::decode(&mut r) {
            Ok(fh) => reply_with(request_id, ops::readlink(rt, &fh), |path, dc| {
                dc.encode_str(path)
            }),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Rename => match RenameArgs::decode(&mut r) {
            Ok(args) => reply_empty(
                request_id,
                ops::rename(rt, &args.from.dir, args.from.name, &args.to.dir, args.to.name),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Read => match ReadArgs::decode(&mut r) {
            Ok(args) => reply_with(
                request_id,
                ops::read(rt, &args.cap, args.offset, args.count),
                |data, dc| dc.encode_data(data),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Write => match WriteArgs::decode(&mut r) {
            Ok(args) => reply_with(
                request_id,
                ops::write(rt, &args.cap, args.offset, args.data),
                |written, dc| dc.encode_u32(*written),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Md5Sum => match Md5SumArgs::decode(&mut r) {
            Ok(args) => reply_with(request_id, ops::md5sum(rt, &args), |res, dc| {
                res.encode(dc)
            }),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::FileInfo => match ZfsFh::decode(&mut r) {
            Ok(fh) => reply_with(request_id, ops::file_info(rt, &fh), |path, dc| {
                dc.encode_str(path)
            }),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::Forget => {
            if let Ok(args) = ForgetArgs::decode(&mut r) {
                ops::forget(rt, &args.file, args.count);
            }
            None
        }

        Opcode::SetXattr => match SetXattrArgs::decode(&mut r) {
            Ok(args) => reply_empty(
                request_id,
                ops::setxattr(rt, &args.file, args.name, args.value, args.flags),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::GetXattr => match XattrNameArgs::decode(&mut r) {
            Ok(args) => reply_with(
                request_id,
                ops::getxattr(rt, &args.file, args.name),
                |data, dc| dc.encode_data(data),
            ),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::ListXattr => match ZfsFh::decode(&mut r) {
            Ok(fh) => reply_with(request_id, ops::listxattr(rt, &fh), |data, dc| {
                dc.encode_data(data)
            }),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },

        Opcode::RemoveXattr => match XattrNameArgs::decode(&mut r) {
            Ok(args) => reply_empty(request_id, ops::removexattr(rt, &args.file, args.name)),
            Err(_) => reply_empty(request_id, Err(ZfsError::Inval)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proto::DirOpRes;

    fn local_rt() -> (tempfile::TempDir, Arc<Runtime>) {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            "nodeid 1\nnodename orion\nvolume 5 home /home 1 {}\n",
            dir.path().display()
        );
        let rt = Runtime::new(Config::parse(&text).unwrap()).unwrap();
        (dir, rt)
    }

    fn request(
        request_id: u32,
        opcode: u32,
        body: impl FnOnce(&mut DataCoder) -> Result<(), CodecError>,
    ) -> Vec<u8> {
        let mut dc = DataCoder::new();
        dc.start_encoding();
        RequestHeader {
            request_id,
            opcode,
            from_sid: 9,
        }
        .encode(&mut dc)
        .unwrap();
        body(&mut dc).unwrap();
        dc.finish_encoding().to_vec()
    }

    fn parse_reply(frame: &[u8]) -> (ReplyHeader, FrameReader<'_>) {
        let mut r = FrameReader::new(frame).unwrap();
        let header = ReplyHeader::decode(&mut r).unwrap();
        (header, r)
    }

    #[test]
    fn null_round_trip() {
        let (_dir, rt) = local_rt();
        let frame = request(5, Opcode::Null.into(), |_| Ok(()));
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.request_id, 5);
        assert_eq!(header.error, 0);
    }

    #[test]
    fn unknown_opcode_is_enosys() {
        let (_dir, rt) = local_rt();
        let frame = request(6, 999, |_| Ok(()));
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, ZfsError::NoSys.to_wire());
    }

    #[test]
    fn garbled_frame_is_dropped() {
        let (_dir, rt) = local_rt();
        // A reply-shaped frame: too short for a request envelope.
        let mut dc = DataCoder::new();
        dc.start_encoding();
        ReplyHeader {
            request_id: 1,
            error: 0,
        }
        .encode(&mut dc)
        .unwrap();
        let frame = dc.finish_encoding().to_vec();
        assert!(handle_frame(&rt, RequestSource::Kernel, &frame).is_none());
    }

    #[test]
    fn lookup_and_mkdir_over_the_wire() {
        let (_dir, rt) = local_rt();

        // ROOT
        let frame = request(1, Opcode::Root.into(), |_| Ok(()));
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, mut r) = parse_reply(&reply);
        assert_eq!(header.error, 0);
        let root = DirOpRes::decode(&mut r).unwrap();

        // LOOKUP home
        let frame = request(2, Opcode::Lookup.into(), |dc| {
            DirOpArgs {
                dir: root.file,
                name: b"home",
            }
            .encode(dc)
        });
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, mut r) = parse_reply(&reply);
        assert_eq!(header.error, 0);
        let home = DirOpRes::decode(&mut r).unwrap();

        // MKDIR home/sub
        let frame = request(3, Opcode::Mkdir.into(), |dc| {
            MkdirArgs {
                location: DirOpArgs {
                    dir: home.file,
                    name: b"sub",
                },
                attr: Sattr::default(),
            }
            .encode(dc)
        });
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, mut r) = parse_reply(&reply);
        assert_eq!(header.error, 0);
        let sub = DirOpRes::decode(&mut r).unwrap();
        assert_eq!(sub.attr.ftype, crate::proto::FType::Dir);

        // Second MKDIR answers EEXIST.
        let frame = request(4, Opcode::Mkdir.into(), |dc| {
            MkdirArgs {
                location: DirOpArgs {
                    dir: home.file,
                    name: b"sub",
                },
                attr: Sattr::default(),
            }
            .encode(dc)
        });
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, ZfsError::Exist.to_wire());
    }

    #[test]
    fn forget_has_no_reply() {
        let (_dir, rt) = local_rt();
        let frame = request(9, Opcode::Forget.into(), |dc| {
            ForgetArgs {
                file: ZfsFh::default(),
                count: 1,
            }
            .encode(dc)
        });
        assert!(handle_frame(&rt, RequestSource::Kernel, &frame).is_none());
    }

    #[test]
    fn exiting_daemon_refuses_work() {
        let (_dir, rt) = local_rt();
        rt.shutdown();
        let frame = request(9, Opcode::Root.into(), |_| Ok(()));
        let reply = handle_frame(&rt, RequestSource::Kernel, &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, ZfsError::Exiting.to_wire());
    }

    #[test]
    fn peers_must_authenticate_first() {
        use std::net::{TcpListener, TcpStream};

        let (_dir, rt) = local_rt();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _server = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let conn = PeerConn::new(stream).unwrap();

        // Data op before auth: EACCES.
        let frame = request(1, Opcode::Root.into(), |_| Ok(()));
        let reply = handle_frame(&rt, RequestSource::Peer(&conn), &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, ZfsError::Access.to_wire());

        // Stage 2 before stage 1: EACCES.
        let frame = request(2, Opcode::AuthStage2.into(), |dc| {
            ConnectionSpeed::Fast.encode(dc)
        });
        let reply = handle_frame(&rt, RequestSource::Peer(&conn), &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, ZfsError::Access.to_wire());

        // Unknown node name: EACCES.
        let frame = request(3, Opcode::AuthStage1.into(), |dc| dc.encode_str(b"mystery"));
        let reply = handle_frame(&rt, RequestSource::Peer(&conn), &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, ZfsError::Access.to_wire());
    }

    #[test]
    fn auth_handshake_enables_data_ops() {
        use std::net::{TcpListener, TcpStream};

        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            "nodeid 1\nnodename orion\nnode 2 vega vega.example.com\n\
             volume 5 home /home 1 {}\n",
            dir.path().display()
        );
        let rt = Runtime::new(Config::parse(&text).unwrap()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let conn = PeerConn::new(stream).unwrap();

        let frame = request(1, Opcode::AuthStage1.into(), |dc| dc.encode_str(b"vega"));
        let reply = handle_frame(&rt, RequestSource::Peer(&conn), &frame).unwrap();
        let (header, mut r) = parse_reply(&reply);
        assert_eq!(header.error, 0);
        assert_eq!(crate::proto::decode_nodename(&mut r).unwrap(), b"orion");

        let frame = request(2, Opcode::AuthStage2.into(), |dc| {
            ConnectionSpeed::Fast.encode(dc)
        });
        let reply = handle_frame(&rt, RequestSource::Peer(&conn), &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, 0);
        assert!(conn.is_authed());

        // The peer is now linked to its node with the negotiated speed.
        let vega = rt.nodes.by_name("vega").unwrap();
        assert_eq!(vega.lock_state().speed, ConnectionSpeed::Fast);
        assert!(vega.conn().is_some());

        let frame = request(3, Opcode::Root.into(), |_| Ok(()));
        let reply = handle_frame(&rt, RequestSource::Peer(&conn), &frame).unwrap();
        let (header, _) = parse_reply(&reply);
        assert_eq!(header.error, 0);
    }
}

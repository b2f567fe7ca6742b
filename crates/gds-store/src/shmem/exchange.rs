//! Connection-info exchange
//!
//! Instead of the data itself the server sends each client the
//! [`ConnectionInfo`] of the segments holding it. A job payload is the
//! namespace followed by one `SHMEM_CONNECTION_INFO` key/value per segment;
//! a modex reply is the `SHMEM_CONNECTION_INFO` tag followed by the packed
//! record. Buffers in any other shape belong to the hash backend and are
//! refused untouched.

use super::arena::Arena;
use super::hash2::ENTRY_OVERHEAD;
use super::job::{JobView, ModexItem, build_modex_segment, session_id};
use super::segment::{ConnectionInfo, SegmentKind};
use super::ShmemStore;
use crate::env::GdsEnv;
use crate::module::{ModexCtx, PeerInfo};
use gds_common::codec::unpack_modex_kval;
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, Nspace, ProcId, Rank, Result, Value, WireBuffer};
use tracing::{debug, error};

/// Split a QUALIFIED_VALUE into its primary pair and qualifiers
fn split_qualified(kv: KeyValue) -> Result<(KeyValue, Vec<Info>)> {
    if !kv.check_key(keys::QUALIFIED_VALUE) {
        return Ok((kv, Vec::new()));
    }
    let items = kv.value.as_info_array()?;
    let Some((primary, rest)) = items.split_first() else {
        return Err(Error::bad_param("empty qualified value"));
    };
    let quals = rest
        .iter()
        .map(|q| Info::qualifier(q.key.clone(), q.value.clone()))
        .collect();
    Ok((KeyValue::from(primary.clone()), quals))
}

fn unpack_modex(nspace: &Nspace, buf: &mut WireBuffer, ctx: &ModexCtx) -> Result<Vec<ModexItem>> {
    let mut items = Vec::new();
    loop {
        let proc: ProcId = match buf.unpack() {
            Ok(p) => p,
            Err(Error::EndOfBuffer) => break,
            Err(e) => return Err(e),
        };
        if proc.nspace != *nspace {
            return Err(Error::not_supported(format!(
                "modex for {nspace} carries data of {}",
                proc.nspace
            )));
        }
        let bytes: Vec<u8> = buf.unpack()?;
        let rank = if proc.rank.is_undef() { Rank::new(0) } else { proc.rank };
        let mut blob = WireBuffer::from_bytes(bytes);
        loop {
            match unpack_modex_kval(&mut blob, ctx.key_format, &ctx.kmap) {
                Ok(kv) => {
                    let (kv, quals) = split_qualified(kv)?;
                    items.push(ModexItem { rank, kv, quals });
                }
                Err(Error::EndOfBuffer) => break,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(items)
}

impl ShmemStore {
    /// Server side of job registration: hand out the segment records
    pub(super) fn pack_connection_info(
        &mut self,
        env: &GdsEnv,
        peer: &PeerInfo,
        out: &mut WireBuffer,
    ) -> Result<()> {
        if !env.is_server() {
            return Err(Error::not_supported("job registration outside the server"));
        }
        let nspace = &peer.proc.nspace;
        let Some(job) = self.jobs.get(nspace).filter(|j| j.job.is_some()) else {
            return Err(Error::not_supported(format!("no job segment for {nspace}")));
        };
        let session = job
            .session
            .and_then(|id| self.sessions.get(&id))
            .map(|s| &s.arena);

        out.pack(nspace.as_str())?;
        for arena in job.job.iter().chain(session).chain(job.modex.iter()) {
            let cinfo = arena.connection_info().to_value()?;
            out.pack(&KeyValue::new(keys::SHMEM_CONNECTION_INFO, cinfo))?;
        }
        debug!("sent segment records of {} to peer {}", nspace, peer.id);
        Ok(())
    }

    /// Client side of job registration: attach every segment named
    pub(super) fn attach_job(
        &mut self,
        _env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
    ) -> Result<()> {
        let mut pending = buf.clone();
        let ns: String = match pending.unpack() {
            Ok(ns) => ns,
            Err(Error::EndOfBuffer) => return Err(Error::bad_param("empty job info buffer")),
            Err(e) => return Err(e),
        };
        if ns != nspace.as_str() {
            error!("job payload for {} delivered as {}", ns, nspace);
            return Err(Error::bad_param(format!("payload namespace {ns} != {nspace}")));
        }
        let mut records = Vec::new();
        loop {
            let kv: KeyValue = match pending.unpack() {
                Ok(kv) => kv,
                Err(Error::EndOfBuffer) => break,
                Err(_) => return Err(Error::not_supported("job payload is not a segment list")),
            };
            if !kv.check_key(keys::SHMEM_CONNECTION_INFO) {
                return Err(Error::not_supported("job payload carries plain data"));
            }
            records.push(ConnectionInfo::from_value(&kv.value)?);
        }
        if records.is_empty() {
            return Err(Error::not_supported(format!("no segments for {nspace}")));
        }

        for info in &records {
            match info.kind {
                SegmentKind::Job => {
                    if self.jobs.get(nspace).is_some_and(|j| j.job.is_some()) {
                        continue;
                    }
                    let arena = Arena::open(info)?;
                    let view = JobView::new(&arena)?;
                    if view.nspace()? != nspace.as_str() {
                        return Err(Error::segment(format!(
                            "{} does not hold {nspace}",
                            info.path.display()
                        )));
                    }
                    self.jobs.entry(nspace.clone()).or_default().job = Some(arena);
                }
                SegmentKind::Session => {
                    if self.jobs.get(nspace).is_some_and(|j| j.session.is_some()) {
                        continue;
                    }
                    let id: u32 = info
                        .nsid
                        .parse()
                        .map_err(|_| Error::segment(format!("bad session id {}", info.nsid)))?;
                    self.retain_session(id, || {
                        let arena = Arena::open(info)?;
                        if session_id(&arena)? != id {
                            return Err(Error::segment(format!("session segment is not {id}")));
                        }
                        Ok(arena)
                    })?;
                    self.jobs.entry(nspace.clone()).or_default().session = Some(id);
                }
                SegmentKind::Modex => self.attach_round(nspace, info)?,
            }
        }
        *buf = pending;
        debug!("attached {} segments of {}", records.len(), nspace);
        Ok(())
    }

    /// Server side of a modex: write the data into the modex segment
    pub(super) fn publish_modex(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
        ctx: &mut ModexCtx,
    ) -> Result<()> {
        let raw = buf.remaining();
        let mut pending = buf.clone();
        let items = unpack_modex(nspace, &mut pending, ctx)?;

        let round = self.jobs.get(nspace).map_or(0, |j| j.modex.len());
        let estimate = raw * 2 + items.len() * ENTRY_OVERHEAD;
        let arena = match build_modex_segment(env, nspace, round, &items, estimate) {
            Ok(arena) => arena,
            Err(Error::OutOfMemory { requested, available }) => {
                return Err(Error::not_supported(format!(
                    "modex round of {nspace} does not fit ({requested} > {available} bytes)"
                )));
            }
            Err(e) => return Err(e),
        };

        ctx.reply.pack(keys::SHMEM_CONNECTION_INFO)?;
        ctx.reply.pack(&arena.connection_info().to_value()?)?;
        self.jobs.entry(nspace.clone()).or_default().modex.push(arena);
        *buf = pending;
        debug!("stored {} modex items of {} in shared memory", items.len(), nspace);
        Ok(())
    }

    fn attach_round(&mut self, nspace: &Nspace, info: &ConnectionInfo) -> Result<()> {
        let job = self.jobs.entry(nspace.clone()).or_default();
        if !job.modex.iter().any(|a| a.segment().path() == info.path) {
            job.modex.push(Arena::open(info)?);
        }
        Ok(())
    }

    /// Client side of a modex: attach the segment named in the reply
    pub(super) fn attach_modex(&mut self, nspace: &Nspace, buf: &mut WireBuffer) -> Result<()> {
        let mut pending = buf.clone();
        let mut attached = 0;
        loop {
            match pending.unpack::<String>() {
                Ok(tag) if tag == keys::SHMEM_CONNECTION_INFO => {}
                Err(Error::EndOfBuffer) if attached > 0 => break,
                _ => return Err(Error::not_supported("modex data is not in shared memory")),
            }
            let value: Value = pending.unpack()?;
            self.attach_round(nspace, &ConnectionInfo::from_value(&value)?)?;
            attached += 1;
        }
        *buf = pending;
        Ok(())
    }
}

//! Bootloader command handlers
//!
//! One handler per UWF record type. Each takes the current [`SessionState`],
//! performs whatever request/acknowledge exchanges the record requires and
//! returns the next state. Any missing or wrong acknowledge aborts the
//! command; nothing is retried.

use byteorder::{ByteOrder, LittleEndian};
use embedded_hal::blocking::delay::DelayMs;

use crate::error::Step;
use crate::model::Profile;
use crate::protocol::{self, ACK, NACK, SYNC, SYNC_RESPONSE_LEN};
use crate::record::{Payload, Registration};
use crate::sector::SectorMap;
use crate::state::{Phase, SessionState};
use crate::{Error, Link, SerialPort};

pub struct Session<P, D, E> {
    link: Link<P, D, E>,
    profile: &'static Profile,
    /// Multi-step exchange in flight, left set if it failed part way
    active: Option<Phase>,
}

impl<P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(link: Link<P, D, E>, profile: &'static Profile) -> Self {
        Self { link, profile, active: None }
    }

    pub fn link(&mut self) -> &mut Link<P, D, E> {
        &mut self.link
    }

    pub fn into_inner(self) -> Link<P, D, E> {
        self.link
    }

    /// Phase of the session given the last state a handler returned
    pub fn phase(&self, state: &SessionState) -> Phase {
        match self.active {
            Some(p) if !state.failed && !state.closed => p,
            _ => state.phase(),
        }
    }

    /// Apply one decoded record to the session
    pub fn handle(&mut self, state: &SessionState, payload: Payload) -> Result<SessionState, Error<E>> {
        match payload {
            Payload::TargetPlatform { platform_id } => self.target_platform(state, &platform_id),
            Payload::RegisterDevice(reg) => self.register_device(state, &reg),
            Payload::SelectDevice { handle, bank } => {
                debug!("Select device: handle={} bank={}", handle, bank);
                state.select(handle, bank)
            }
            Payload::SectorMap(map) => self.sector_map(state, map),
            Payload::EraseBlocks { offset, size } => self.erase_blocks(state, offset, size),
            Payload::WriteBlocks { offset, flags, data } => {
                self.write_blocks(state, offset, flags, &data)
            }
            Payload::UnregisterDevice { handle } => {
                debug!("Unregister device: handle={}", handle);
                Ok(state.unregister(handle))
            }
            Payload::Unknown { tag, len } => {
                debug!("Skipping unknown record 0x{:02x} ({} bytes)", tag, len);
                Ok(state.clone())
            }
        }
    }

    /// Synchronise with the bootloader and check the platform id
    pub fn target_platform(
        &mut self,
        state: &SessionState,
        platform_id: &[u8; 4],
    ) -> Result<SessionState, Error<E>> {
        debug!("Synchronising with bootloader");
        self.active = Some(Phase::Synchronizing);

        let banner = self.link.transact(&[SYNC], SYNC_RESPONSE_LEN)?;
        if banner.len() != SYNC_RESPONSE_LEN {
            error!("Sync response was {} of {} bytes", banner.len(), SYNC_RESPONSE_LEN);
            return Err(Error::Timeout(Step::Sync));
        }
        trace!("Sync response: {}", hex::encode(&banner));

        self.request(Step::SyncAck, &[ACK])?;

        info!("Platform: id=0x{:08X}", LittleEndian::read_u32(platform_id));
        self.request(Step::PlatformCheck, &protocol::platform_check(platform_id))?;

        self.active = None;
        Ok(state.synchronize())
    }

    pub fn register_device(
        &mut self,
        state: &SessionState,
        reg: &Registration,
    ) -> Result<SessionState, Error<E>> {
        debug!(
            "Register device: handle={} addr=0x{:08x} banks={} size=0x{:x} algo={}",
            reg.handle, reg.base_address, reg.num_banks, reg.bank_size, reg.bank_algorithm
        );
        self.profile.check_registration::<E>(reg)?;
        state.register(reg)
    }

    pub fn sector_map(&mut self, state: &SessionState, map: SectorMap) -> Result<SessionState, Error<E>> {
        debug!("Sector map: {:?}", map.groups());
        state.with_sector_map(map)
    }

    /// Erase every sector covering `[offset, offset + size)` of the selected bank
    pub fn erase_blocks(
        &mut self,
        state: &SessionState,
        offset: u32,
        size: u32,
    ) -> Result<SessionState, Error<E>> {
        let target = state.erase_target::<E>(offset, size)?;
        info!(
            "Erase: addr=0x{:08x} (offset=0x{:x}) size=0x{:x}",
            target.base_address.wrapping_add(offset),
            offset,
            size
        );

        let mut sectors = 0;
        for sector in target.map.erase_addresses(offset, size) {
            let address = target.base_address.wrapping_add(sector);
            trace!("Erase sector 0x{:08x}", address);
            self.request(Step::Erase, &protocol::erase(address))?;
            sectors += 1;
        }
        debug!("Erased {} sectors", sectors);

        Ok(state.erased(sectors))
    }

    /// Write `data` at `offset` of the selected bank in blocks, verifying
    /// a checksum after every `verify_limit` blocks and after the last one
    pub fn write_blocks(
        &mut self,
        state: &SessionState,
        offset: u32,
        flags: u32,
        data: &[u8],
    ) -> Result<SessionState, Error<E>> {
        self.link.options().validate::<E>()?;
        let base = state.write_target::<E>(offset, data.len())?;
        let block_size = self.link.options().block_size;
        let verify_limit = self.link.options().verify_limit;
        self.active = Some(Phase::Writing);

        let mut address = base.wrapping_add(offset);
        info!(
            "Write: addr=0x{:08x} (offset=0x{:x}) flags=0x{:x} len=0x{:x}",
            address,
            offset,
            flags,
            data.len()
        );

        let mut verify_start = address;
        let mut verify_len = 0u32;
        let mut verify_sum = 0u32;
        let mut pending = 0;

        let blocks = data.chunks(block_size).count();
        for (i, block) in data.chunks(block_size).enumerate() {
            self.request(Step::WriteCommand, &protocol::write(address, block.len() as u8))?;
            self.request(Step::WriteData, &protocol::data(block))?;

            address = address.wrapping_add(block.len() as u32);
            verify_len += block.len() as u32;
            verify_sum = verify_sum.wrapping_add(protocol::checksum(block));
            pending += 1;

            if pending >= verify_limit || i + 1 == blocks {
                trace!(
                    "Verify 0x{:08x} len=0x{:x} sum=0x{:08x}",
                    verify_start,
                    verify_len,
                    verify_sum
                );
                self.request(
                    Step::Verify,
                    &protocol::verify(verify_start, verify_len, verify_sum),
                )?;
                verify_start = address;
                verify_len = 0;
                verify_sum = 0;
                pending = 0;
            }
        }

        self.active = None;
        Ok(state.written(data.len()))
    }

    /// Send a request and require a single acknowledge byte
    fn request(&mut self, step: Step, request: &[u8]) -> Result<(), Error<E>> {
        let resp = self.link.transact(request, 1)?;
        match resp.first() {
            Some(&ACK) => Ok(()),
            Some(&NACK) => {
                debug!("Received bootloader nack to {}", step);
                Err(Error::Rejected(step))
            }
            Some(&v) => {
                debug!("Received unexpected value 0x{:02x} to {}", v, step);
                Err(Error::UnexpectedResponse { step, value: v })
            }
            None => {
                error!("Receive timeout on {}", step);
                Err(Error::Timeout(step))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, NoDelay};
    use crate::model::GENERIC;
    use crate::sector::SectorGroup;
    use crate::Options;

    fn session(port: MockPort) -> Session<MockPort, NoDelay, ()> {
        Session::new(Link::new(port, NoDelay::default(), Options::default()), &GENERIC)
    }

    fn ready() -> SessionState {
        let reg = Registration {
            handle: 0,
            base_address: 0x0001_0000,
            num_banks: 1,
            bank_size: 12288,
            bank_algorithm: 1,
        };
        let map = SectorMap::new(vec![
            SectorGroup { count: 4, size: 1024 },
            SectorGroup { count: 2, size: 4096 },
        ]);
        SessionState::default()
            .synchronize()
            .register::<()>(&reg)
            .unwrap()
            .select::<()>(0, 0)
            .unwrap()
            .with_sector_map::<()>(map)
            .unwrap()
    }

    fn acks(frame: &[u8]) -> Vec<u8> {
        match frame {
            [0x80] => vec![0x55; 14],
            _ => vec![ACK],
        }
    }

    #[test]
    fn target_platform_syncs_then_checks_id() {
        let mut s = session(MockPort::new(acks));
        let next = s
            .target_platform(&SessionState::default(), &[0x01, 0x02, 0x03, 0x04])
            .unwrap();
        assert!(next.synchronized);

        let port = s.into_inner().into_inner().0;
        assert_eq!(
            port.requests(),
            vec![vec![0x80], vec![b'a'], vec![b'p', 0x01, 0x02, 0x03, 0x04]]
        );
    }

    #[test]
    fn short_sync_banner_fails_sync() {
        let mut s = session(MockPort::new(|_| vec![0x55; 4]));
        let r = s.target_platform(&SessionState::default(), &[0; 4]);
        assert_eq!(r, Err(Error::Timeout(Step::Sync)));
    }

    #[test]
    fn platform_rejection_is_reported() {
        let mut s = session(MockPort::new(|f| match f[0] {
            b'p' => vec![NACK],
            _ => acks(f),
        }));
        let r = s.target_platform(&SessionState::default(), &[0; 4]);
        assert_eq!(r, Err(Error::Rejected(Step::PlatformCheck)));
    }

    #[test]
    fn erase_sends_one_command_per_sector() {
        let mut s = session(MockPort::new(acks));
        let next = s.erase_blocks(&ready(), 0, 12288).unwrap();
        assert!(next.erased);
        assert_eq!(next.sectors_erased, 6);

        let port = s.into_inner().into_inner().0;
        let expected: Vec<Vec<u8>> = [0u32, 1024, 2048, 3072, 4096, 8192]
            .iter()
            .map(|a| protocol::erase(0x0001_0000 + a).to_vec())
            .collect();
        assert_eq!(port.requests(), expected);
    }

    #[test]
    fn erase_before_registration_sends_nothing() {
        let mut s = session(MockPort::new(acks));
        let state = SessionState::default().synchronize();
        let r = s.erase_blocks(&state, 0, 4096);
        assert!(matches!(r, Err(Error::Precondition(_))));

        let port = s.into_inner().into_inner().0;
        assert!(port.tx.is_empty());
    }

    #[test]
    fn first_erase_nack_aborts() {
        let mut count = 0;
        let mut s = session(MockPort::new(move |_| {
            count += 1;
            if count == 3 {
                vec![b'x']
            } else {
                vec![ACK]
            }
        }));
        let r = s.erase_blocks(&ready(), 0, 12288);
        assert_eq!(
            r,
            Err(Error::UnexpectedResponse { step: Step::Erase, value: b'x' })
        );
        let port = s.into_inner().into_inner().0;
        assert_eq!(port.requests().len(), 3);
    }

    #[test]
    fn write_verifies_once_for_three_blocks() {
        let data: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
        let sum: u32 = data.iter().map(|b| *b as u32).sum();

        let mut s = session(MockPort::new(acks));
        let state = ready().erased(6);
        let next = s.write_blocks(&state, 0x100, 0, &data).unwrap();
        assert!(next.write_complete);
        assert_eq!(next.bytes_written, 600);

        let port = s.into_inner().into_inner().0;
        let reqs = port.requests();
        let sizes: Vec<u8> = reqs.iter().filter(|r| r[0] == b'w').map(|r| r[5]).collect();
        assert_eq!(sizes, vec![252, 252, 96]);

        let verifies: Vec<&Vec<u8>> = reqs.iter().filter(|r| r[0] == b'v').collect();
        assert_eq!(verifies.len(), 1);
        assert_eq!(*verifies[0], protocol::verify(0x0001_0100, 600, sum).to_vec());
        assert_eq!(reqs.last().map(|r| r[0]), Some(b'v'));

        // write command addresses advance by block
        let addrs: Vec<&[u8]> = reqs.iter().filter(|r| r[0] == b'w').map(|r| &r[1..5]).collect();
        assert_eq!(addrs[1], &(0x0001_0100u32 + 252).to_le_bytes()[..]);
    }

    #[test]
    fn write_verifies_every_limit_blocks() {
        let data = vec![1u8; 16 * 10];
        let options = Options { block_size: 16, verify_limit: 4, ..Options::default() };
        let link = Link::new(MockPort::new(acks), NoDelay::default(), options);
        let mut s = Session::new(link, &GENERIC);

        s.write_blocks(&ready().erased(6), 0, 0, &data).unwrap();

        let port = s.into_inner().into_inner().0;
        let verifies: Vec<Vec<u8>> = port
            .requests()
            .into_iter()
            .filter(|r| r[0] == b'v')
            .collect();
        assert_eq!(
            verifies,
            vec![
                protocol::verify(0x0001_0000, 64, 64).to_vec(),
                protocol::verify(0x0001_0040, 64, 64).to_vec(),
                protocol::verify(0x0001_0080, 32, 32).to_vec(),
            ]
        );
    }

    #[test]
    fn third_data_nack_leaves_write_incomplete() {
        let mut data_blocks = 0;
        let mut s = session(MockPort::new(move |f| {
            if f[0] == b'd' {
                data_blocks += 1;
                if data_blocks == 3 {
                    return vec![NACK];
                }
            }
            vec![ACK]
        }));
        let state = ready().erased(6);
        let r = s.write_blocks(&state, 0, 0, &[0u8; 600]);
        assert_eq!(r, Err(Error::Rejected(Step::WriteData)));
        assert!(!state.write_complete);
        assert_eq!(s.phase(&state), Phase::Writing);
    }

    #[test]
    fn completed_write_leaves_no_exchange_in_flight() {
        let mut s = session(MockPort::new(acks));
        let state = ready().erased(6);
        assert_eq!(s.phase(&state), Phase::Erased);

        let next = s.write_blocks(&state, 0, 0, &[0u8; 32]).unwrap();
        assert_eq!(s.phase(&next), Phase::WriteComplete);
    }

    #[test]
    fn failed_sync_stays_synchronizing() {
        let mut s = session(MockPort::new(|_| vec![]));
        let state = SessionState::default();
        assert!(s.target_platform(&state, &[0; 4]).is_err());
        assert_eq!(s.phase(&state), Phase::Synchronizing);
    }

    #[test]
    fn zero_block_size_is_rejected_before_traffic() {
        let options = Options { block_size: 0, ..Options::default() };
        let link = Link::new(MockPort::new(acks), NoDelay::default(), options);
        let mut s = Session::new(link, &GENERIC);

        let r = s.write_blocks(&ready().erased(6), 0, 0, &[0u8; 64]);
        assert!(matches!(r, Err(Error::InvalidOption(_))));
        assert!(s.into_inner().into_inner().0.tx.is_empty());
    }

    #[test]
    fn oversized_write_is_rejected_before_traffic() {
        let mut s = session(MockPort::new(acks));
        let r = s.write_blocks(&ready().erased(6), 0, 0, &vec![0u8; 12289]);
        assert!(matches!(r, Err(Error::OutOfBank { what: "write", .. })));
        assert!(s.into_inner().into_inner().0.tx.is_empty());
    }
}

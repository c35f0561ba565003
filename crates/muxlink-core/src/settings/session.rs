//! Configuration session
//!
//! A [`Session`] owns the link to one device and drives the configuration
//! protocol on top of it: reading the current settings, plain writes while
//! the device is open, the ACL/key provisioning sequence, locking, and the
//! signed writes a locked device demands. Every write can be followed by a
//! verification read that compares the device's reported state against the
//! intended values.
//!
//! Lock state is an explicit machine, not a flag: transitions are guarded
//! here so a doomed request (locking with no stored key, signing with no
//! selected key) is rejected before a single byte reaches the wire.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::acl::AclVector;
use super::document::{is_write_only, SettingsDocument};
use super::signer::{AuthKey, Signer};
use super::{acl_slot_path, key_slot_path, KEY_SLOTS};
use crate::error::Mismatch;
use crate::fwinfo::{FwInfoReader, InfoCodec};
use crate::transport::{Link, LinkConfig, LinkCounters, Transport, CHANNEL_SETTINGS};
use crate::ProtocolError;

/// Where the device is in its lock lifecycle, as seen by this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Device accepts plain writes to every path
    Unlocked,
    /// A key and ACL vector have been stored but the device is not yet locked
    Provisioning,
    /// Device only applies signed writes
    Locked,
}

/// Session tuning: timings and the device-specific restart request.
///
/// The restart channel and payload are not part of the settings protocol
/// proper; defaults match the reference firmware but integrators can point
/// them at their device's management service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Link-level timing (response timeout, poll interval)
    pub link: LinkConfig,
    /// Pause after each write before the read-back; the device needs
    /// processing time before it reports the new values
    pub settle_delay: Duration,
    /// Channel carrying the restart request
    pub restart_channel: u8,
    /// Payload of the restart request
    pub restart_payload: Vec<u8>,
    /// How many times to retry opening the transport after a restart
    pub reconnect_attempts: u32,
    /// Pause between reconnect attempts
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            settle_delay: Duration::from_millis(200),
            restart_channel: 0x14,
            restart_payload: vec![0x01],
            reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// A configuration session with one device.
pub struct Session {
    link: Option<Link>,
    config: SessionConfig,
    state: LockState,
    fwinfo: FwInfoReader,
    signer: Option<(u8, Signer)>,
    stored_slots: Vec<u8>,
    serial_number: Option<String>,
}

impl Session {
    /// Open a session over a connected transport.
    ///
    /// Reads the current settings once to discover whether the device is
    /// already locked. The firmware-info codec is injected because its
    /// schema belongs to the device, not to this protocol.
    pub fn connect(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        info_codec: Box<dyn InfoCodec>,
    ) -> Result<Self, ProtocolError> {
        let mut link = Link::new(transport, config.link.clone())?;
        link.attach_json_channel(CHANNEL_SETTINGS);

        let mut session = Self {
            link: Some(link),
            config,
            state: LockState::Unlocked,
            fwinfo: FwInfoReader::new(info_codec),
            signer: None,
            stored_slots: Vec::new(),
            serial_number: None,
        };

        let current = session.read()?;
        session.state = lock_state_of(&current);
        info!(state = ?session.state, "session established");
        Ok(session)
    }

    /// The device's lock state as last observed.
    pub fn lock_state(&self) -> LockState {
        self.state
    }

    /// True while the link to the device is up.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// The key slot currently selected for signing, if any.
    pub fn active_key_slot(&self) -> Option<u8> {
        self.signer.as_ref().map(|(slot, _)| *slot)
    }

    /// Traffic counters of the underlying link.
    pub fn counters(&self) -> LinkCounters {
        self.link.as_ref().map(Link::counters).unwrap_or_default()
    }

    /// Drop the link. Further operations fail with `NotConnected`.
    pub fn disconnect(&mut self) {
        self.link = None;
        self.serial_number = None;
    }

    /// Select the key used to sign writes to a locked device.
    ///
    /// Needed when connecting to a device that was locked in an earlier
    /// session; [`store_key`](Self::store_key) selects the key implicitly.
    pub fn use_key(&mut self, slot: u8, key: AuthKey) -> Result<(), ProtocolError> {
        if slot >= KEY_SLOTS {
            return Err(ProtocolError::InvalidKeySlot(slot));
        }
        self.signer = Some((slot, Signer::new(key)));
        Ok(())
    }

    /// Read the device's full current configuration.
    pub fn read(&mut self) -> Result<SettingsDocument, ProtocolError> {
        let timeout = self.config.link.response_timeout;
        let link = self.link_mut()?;
        link.send(CHANNEL_SETTINGS, b"{}")?;
        let value = link.await_document(CHANNEL_SETTINGS, timeout)?;
        SettingsDocument::from_value(value)
    }

    /// Fetch the device serial number, cached for the session.
    pub fn serial_number(&mut self) -> Result<String, ProtocolError> {
        if let Some(serial) = &self.serial_number {
            return Ok(serial.clone());
        }
        let timeout = self.config.link.response_timeout;
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        let info = self.fwinfo.fetch(link, timeout)?;
        self.serial_number = Some(info.serial_number.clone());
        Ok(info.serial_number)
    }

    /// Write a settings document, signing it if the device is locked.
    ///
    /// With `save` the document also asks the device to persist the change.
    /// On a locked device the serial number is fetched (once), merged under
    /// `sn`, and the document is wrapped in a signed packet with the
    /// selected key; that key must have been chosen before calling, or the
    /// write is rejected without any I/O.
    pub fn write(&mut self, document: SettingsDocument, save: bool) -> Result<(), ProtocolError> {
        // The lock guard holds for every write path, not just `lock()`:
        // locking a device that has no stored key leaves it permanently
        // unconfigurable, so such a document must never reach the wire.
        let requests_lock = document.get("settings/lock") == Some(&Value::Bool(true));
        if requests_lock && self.state != LockState::Locked && self.stored_slots.is_empty() {
            return Err(ProtocolError::Precondition(
                "cannot lock: no authentication key has been stored",
            ));
        }

        let mut document = document;
        if save {
            document.insert("save", true);
        }

        let payload = match self.state {
            LockState::Unlocked | LockState::Provisioning => {
                debug!(paths = document.len(), "plain settings write");
                document.to_bytes()?
            }
            LockState::Locked => {
                if self.signer.is_none() {
                    return Err(ProtocolError::Precondition(
                        "device is locked and no signing key is selected",
                    ));
                }
                let serial = self.serial_number()?;
                document.insert("sn", serial);
                let (slot, signer) = self
                    .signer
                    .as_ref()
                    .map(|(slot, signer)| (*slot, signer))
                    .ok_or(ProtocolError::Precondition(
                        "device is locked and no signing key is selected",
                    ))?;
                debug!(paths = document.len(), slot, "signed settings write");
                signer.sign(&document)?.to_bytes()?
            }
        };

        self.link_mut()?.send(CHANNEL_SETTINGS, &payload)?;
        if requests_lock && self.state != LockState::Locked {
            // Keep the session's view current even when the caller sets the
            // lock path directly; later writes must be signed.
            self.state = LockState::Locked;
            info!("lock request sent, treating device as locked");
        }
        std::thread::sleep(self.config.settle_delay);
        Ok(())
    }

    /// Read back the configuration and compare it against intended values.
    ///
    /// Write-only paths (`save`, `reset`, key slots) are skipped; every
    /// other path must be present and equal. All mismatches are collected
    /// into the error, with the expected and reported value per path.
    /// Retrying is left to the caller.
    pub fn verify(&mut self, intended: &SettingsDocument) -> Result<(), ProtocolError> {
        let current = self.read()?;
        let mismatches = collect_mismatches(intended, &current);
        if mismatches.is_empty() {
            debug!(paths = intended.len(), "verification passed");
            Ok(())
        } else {
            warn!(count = mismatches.len(), "verification failed");
            Err(ProtocolError::VerificationFailed(mismatches))
        }
    }

    /// Write, then verify the device applied it.
    ///
    /// On a locked device a verification failure is reported as
    /// `DeviceRejected`: the firmware signals a bad signature or an ACL deny
    /// by not applying the write, not by a distinct error packet.
    pub fn write_verified(
        &mut self,
        document: SettingsDocument,
        save: bool,
    ) -> Result<(), ProtocolError> {
        let was_locked = self.state == LockState::Locked;
        self.write(document.clone(), save)?;
        match self.verify(&document) {
            Err(ProtocolError::VerificationFailed(mismatches)) if was_locked => {
                Err(ProtocolError::DeviceRejected(mismatches))
            }
            other => other,
        }
    }

    /// Store an authentication key and its ACL vector in a device slot.
    ///
    /// Both are plain writes, so the device must not be locked yet. The ACL
    /// vector is verified by read-back; the key is write-only and cannot be.
    /// The stored key becomes the session's signing key.
    pub fn store_key(
        &mut self,
        slot: u8,
        key: AuthKey,
        acl: AclVector,
    ) -> Result<(), ProtocolError> {
        if slot >= KEY_SLOTS {
            return Err(ProtocolError::InvalidKeySlot(slot));
        }
        if self.state == LockState::Locked {
            return Err(ProtocolError::Precondition(
                "cannot store a key on a locked device",
            ));
        }

        let document = SettingsDocument::new()
            .with(acl_slot_path(slot), acl.encode())
            .with(key_slot_path(slot), key.encode());
        self.write(document.clone(), true)?;
        self.verify(&document)?;

        if !self.stored_slots.contains(&slot) {
            self.stored_slots.push(slot);
        }
        self.signer = Some((slot, Signer::new(key)));
        self.state = LockState::Provisioning;
        info!(slot, "authentication key stored");
        Ok(())
    }

    /// Lock the device: all further protected writes must be signed.
    ///
    /// Rejected before any I/O unless a key was stored in this session —
    /// locking a device with no key would make it unconfigurable.
    pub fn lock(&mut self) -> Result<(), ProtocolError> {
        if self.state == LockState::Locked {
            return Err(ProtocolError::Precondition("device is already locked"));
        }
        if self.stored_slots.is_empty() {
            return Err(ProtocolError::Precondition(
                "cannot lock: no authentication key has been stored",
            ));
        }

        let document = SettingsDocument::new().with("settings/lock", true);
        self.write(document.clone(), true)?;
        self.verify(&document)?;
        self.state = LockState::Locked;
        info!("device locked");
        Ok(())
    }

    /// Send the restart request and drop the link.
    ///
    /// Fire and forget: the device does not answer, the link is down once
    /// the bytes leave. Callers reconnect with
    /// [`reconnect`](Self::reconnect) and should then re-run
    /// [`verify`](Self::verify) to confirm settings persisted.
    pub fn restart(&mut self) -> Result<(), ProtocolError> {
        let channel = self.config.restart_channel;
        let payload = self.config.restart_payload.clone();
        self.link_mut()?.send(channel, &payload)?;
        self.disconnect();
        info!("restart sent, awaiting device");
        Ok(())
    }

    /// Re-establish the link after a restart, bounded by the configured
    /// attempt count.
    ///
    /// `open` is called per attempt to produce a fresh transport; failures
    /// are expected while the device boots. On success the session re-reads
    /// the settings to refresh the lock state (a locked device stays locked
    /// across restarts). Exhausting the attempts is fatal for the session.
    pub fn reconnect(
        &mut self,
        mut open: impl FnMut() -> Result<Box<dyn Transport>, ProtocolError>,
    ) -> Result<(), ProtocolError> {
        for attempt in 1..=self.config.reconnect_attempts {
            std::thread::sleep(self.config.reconnect_delay);

            let transport = match open() {
                Ok(transport) => transport,
                Err(err) => {
                    debug!(attempt, "reconnect attempt failed: {}", err);
                    continue;
                }
            };
            let mut link = Link::new(transport, self.config.link.clone())?;
            link.attach_json_channel(CHANNEL_SETTINGS);
            link.reset_streams()?;
            self.link = Some(link);
            self.serial_number = None;

            match self.read() {
                Ok(current) => {
                    self.state = lock_state_of(&current);
                    info!(attempt, state = ?self.state, "reconnected");
                    return Ok(());
                }
                Err(err) => {
                    debug!(attempt, "device not responding yet: {}", err);
                    self.link = None;
                }
            }
        }
        Err(ProtocolError::ReconnectTimeout)
    }

    fn link_mut(&mut self) -> Result<&mut Link, ProtocolError> {
        self.link.as_mut().ok_or(ProtocolError::NotConnected)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("connected", &self.link.is_some())
            .field("active_key_slot", &self.active_key_slot())
            .finish_non_exhaustive()
    }
}

fn lock_state_of(settings: &SettingsDocument) -> LockState {
    match settings.get("settings/lock") {
        Some(Value::Bool(true)) => LockState::Locked,
        _ => LockState::Unlocked,
    }
}

/// Compare intended values against a device response, skipping write-only
/// paths. A path missing from the response counts as a mismatch.
fn collect_mismatches(intended: &SettingsDocument, current: &SettingsDocument) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    for (path, expected) in intended.iter() {
        if is_write_only(path) {
            continue;
        }
        match current.get(path) {
            Some(actual) if actual == expected => {}
            Some(actual) => mismatches.push(Mismatch {
                path: path.clone(),
                expected: expected.clone(),
                actual: Some(actual.clone()),
            }),
            None => mismatches.push(Mismatch {
                path: path.clone(),
                expected: expected.clone(),
                actual: None,
            }),
        }
    }
    mismatches
}

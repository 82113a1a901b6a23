//! Namespace labels, v1.1 and v1.2.

use nvmctl_common::{Guid, Le16, Le32, Le64};

use super::{LABEL_SIZE_V1_1, LABEL_SIZE_V1_2};

/// The 128-byte v1.1 label, which is also the leading portion of a v1.2
/// label slot.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawLabel {
    pub uuid: Guid,
    /// NUL-terminated.
    pub name: [u8; 64],
    pub flags: Le32,
    /// Number of labels in this label's namespace set.
    pub nlabel: Le16,
    /// This dimm's position in the interleave set.
    pub position: Le16,
    pub isetcookie: Le64,
    pub lbasize: Le64,
    /// Dimm-physical address of the labeled capacity.
    pub dpa: Le64,
    pub rawsize: Le64,
    /// Must equal the physical slot index holding this label.
    pub slot: Le32,
    pub unused: Le32,
}

/// The v1.2 extension that follows [`RawLabel`] inside a 256-byte slot.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawLabelExt {
    pub type_guid: Guid,
    pub abstraction_guid: Guid,
    pub reserved: [u8; 96],
}

impl RawLabel {
    pub fn from_bytes(bytes: &[u8]) -> &RawLabel {
        bytemuck::from_bytes(&bytes[..LABEL_SIZE_V1_1])
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> &mut RawLabel {
        bytemuck::from_bytes_mut(&mut bytes[..LABEL_SIZE_V1_1])
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(64);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; 64];
        let bytes = name.as_bytes();
        let len = bytes.len().min(63);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }
}

/// A label decoded out of a live slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub uuid: Guid,
    pub name: String,
    pub flags: u32,
    pub nlabel: u16,
    pub position: u16,
    pub isetcookie: u64,
    pub lbasize: u64,
    pub dpa: u64,
    pub rawsize: u64,
    pub slot: u32,
    /// Present only for v1.2 slots.
    pub type_guid: Option<Guid>,
    pub abstraction_guid: Option<Guid>,
}

impl Label {
    /// Decodes a slot. `slot_bytes` is the full slot (128 or 256 bytes).
    pub fn decode(slot_bytes: &[u8]) -> Label {
        let raw = RawLabel::from_bytes(slot_bytes);
        let (type_guid, abstraction_guid) = if slot_bytes.len() >= LABEL_SIZE_V1_2 {
            let ext: &RawLabelExt =
                bytemuck::from_bytes(&slot_bytes[LABEL_SIZE_V1_1..LABEL_SIZE_V1_2]);
            (Some(ext.type_guid), Some(ext.abstraction_guid))
        } else {
            (None, None)
        };
        Label {
            uuid: raw.uuid,
            name: raw.name_str().to_owned(),
            flags: raw.flags.get(),
            nlabel: raw.nlabel.get(),
            position: raw.position.get(),
            isetcookie: raw.isetcookie.get(),
            lbasize: raw.lbasize.get(),
            dpa: raw.dpa.get(),
            rawsize: raw.rawsize.get(),
            slot: raw.slot.get(),
            type_guid,
            abstraction_guid,
        }
    }

    /// Encodes into a slot buffer of 128 or 256 bytes.
    pub fn encode(&self, slot_bytes: &mut [u8]) {
        slot_bytes.fill(0);
        {
            let raw = RawLabel::from_bytes_mut(slot_bytes);
            raw.uuid = self.uuid;
            raw.set_name(&self.name);
            raw.flags.set(self.flags);
            raw.nlabel.set(self.nlabel);
            raw.position.set(self.position);
            raw.isetcookie.set(self.isetcookie);
            raw.lbasize.set(self.lbasize);
            raw.dpa.set(self.dpa);
            raw.rawsize.set(self.rawsize);
            raw.slot.set(self.slot);
        }
        if slot_bytes.len() >= LABEL_SIZE_V1_2 {
            let ext: &mut RawLabelExt =
                bytemuck::from_bytes_mut(&mut slot_bytes[LABEL_SIZE_V1_1..LABEL_SIZE_V1_2]);
            ext.type_guid = self.type_guid.unwrap_or_default();
            ext.abstraction_guid = self.abstraction_guid.unwrap_or_default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<RawLabel>(), LABEL_SIZE_V1_1);
    const_assert_eq!(size_of::<RawLabel>() + size_of::<RawLabelExt>(), LABEL_SIZE_V1_2);
    const_assert_eq!(align_of::<RawLabel>(), 1);
    const_assert_eq!(align_of::<RawLabelExt>(), 1);

    const_assert_eq!(offset_of!(RawLabel, uuid), 0);
    const_assert_eq!(offset_of!(RawLabel, name), 16);
    const_assert_eq!(offset_of!(RawLabel, flags), 80);
    const_assert_eq!(offset_of!(RawLabel, nlabel), 84);
    const_assert_eq!(offset_of!(RawLabel, position), 86);
    const_assert_eq!(offset_of!(RawLabel, isetcookie), 88);
    const_assert_eq!(offset_of!(RawLabel, lbasize), 96);
    const_assert_eq!(offset_of!(RawLabel, dpa), 104);
    const_assert_eq!(offset_of!(RawLabel, rawsize), 112);
    const_assert_eq!(offset_of!(RawLabel, slot), 120);

    #[test]
    fn name_truncates_at_63_bytes() {
        let mut raw = RawLabel::zeroed();
        raw.set_name(&"x".repeat(100));
        assert_eq!(raw.name_str().len(), 63);
        raw.set_name("pool0");
        assert_eq!(raw.name_str(), "pool0");
    }

    #[test]
    fn decode_encode_round_trip_v1_2() {
        let label = Label {
            uuid: Guid::parse("0aba224b-e2f4-4e58-9516-fc117b05cf64").unwrap(),
            name: "scratch".into(),
            flags: 0,
            nlabel: 2,
            position: 1,
            isetcookie: 0xdead_beef_f00d,
            lbasize: 512,
            dpa: 0x1000_0000,
            rawsize: 1 << 30,
            slot: 7,
            type_guid: Some(Guid::generate()),
            abstraction_guid: Some(Guid::default()),
        };
        let mut slot = [0u8; LABEL_SIZE_V1_2];
        label.encode(&mut slot);
        assert_eq!(Label::decode(&slot), label);
    }
}

use nvmctl_common::Guid;
use nvmctl_label::{Label, LabelArea, LabelVersion, RawIndexBlock};

const CONFIG_SIZE: usize = 128 * 1024;

#[test]
fn init_on_blank_dimm() {
    let mut area = LabelArea::zeroed(CONFIG_SIZE);
    let plan = area.init(LabelVersion::V1_2).unwrap();

    let v = area.validate().unwrap();
    assert_eq!(v.current, 0);
    assert_eq!(v.nslot, plan.nslot);

    // Index 0 carries sequence 3, index 1 sequence 1.
    let idx0 = RawIndexBlock::from_bytes(&area.data()[..72]);
    let idx1 = RawIndexBlock::from_bytes(&area.data()[v.index_size..v.index_size + 72]);
    assert_eq!(idx0.seq.get(), 3);
    assert_eq!(idx1.seq.get(), 1);
    assert_eq!(idx0.nslot.get(), plan.nslot);
    assert_eq!(idx1.nslot.get(), plan.nslot);

    // A freshly initialized store has every slot free and no labels.
    assert_eq!(area.free_slots(&v), v.nslot);
    assert_eq!(area.labels(&v).count(), 0);
}

#[test]
fn zero_then_init_resets_slot_accounting() {
    let mut area = LabelArea::zeroed(CONFIG_SIZE);
    area.init(LabelVersion::V1_1).unwrap();
    let v = area.validate().unwrap();
    let label = Label {
        uuid: Guid::generate(),
        name: "n0".into(),
        flags: 0,
        nlabel: 1,
        position: 0,
        isetcookie: 1,
        lbasize: 512,
        dpa: 0,
        rawsize: 1 << 26,
        slot: 0,
        type_guid: None,
        abstraction_guid: None,
    };
    area.put_label(&v, 0, &label).unwrap();
    assert_eq!(area.active_count(&v), 1);

    let extent = area.zero();
    assert_eq!(extent.len, CONFIG_SIZE);
    assert!(area.validate().is_err());

    area.init(LabelVersion::V1_1).unwrap();
    let v = area.validate().unwrap();
    assert_eq!(area.active_count(&v), 0);
    assert_eq!(area.free_slots(&v), v.nslot);
}

#[test]
fn label_tuples_survive_a_write_read_cycle() {
    let mut area = LabelArea::zeroed(CONFIG_SIZE);
    area.init(LabelVersion::V1_2).unwrap();
    let v = area.validate().unwrap();

    let mut expected = Vec::new();
    for (slot, position) in [(0u32, 0u16), (7, 1), (100, 2)] {
        let label = Label {
            uuid: Guid::generate(),
            name: format!("ns{position}"),
            flags: 0,
            nlabel: 3,
            position,
            isetcookie: 0xc00c_1e5,
            lbasize: 4096,
            dpa: 0x1_0000_0000 + slot as u64 * (1 << 28),
            rawsize: 1 << 28,
            slot,
            type_guid: Some(Guid::generate()),
            abstraction_guid: None,
        };
        area.put_label(&v, slot, &label).unwrap();
        expected.push((label.uuid, slot, position, label.dpa, label.rawsize));
    }

    // Re-read through a fresh snapshot of the same bytes, as the dimm
    // layer would after a config-read.
    let reread = LabelArea::new(area.data().to_vec());
    let v = reread.validate().unwrap();
    let got: Vec<_> = reread
        .labels(&v)
        .map(|l| (l.uuid, l.slot, l.position, l.dpa, l.rawsize))
        .collect();
    assert_eq!(got, expected);
}

//! Property-based tests for pointer validation, decoding and scanning

use romscan::decode::decode;
use romscan::pointer::{to_rom_pointer, validate};
use romscan::scan::{scan, ScanOptions, Scanner};
use romscan::schema::{Schema, SchemaBuilder, SchemaRef};
use proptest::prelude::*;

/// Recursive layout exercising every field kind.
fn node_schema() -> SchemaRef {
    let node = SchemaRef::deferred("node");
    let leaf = SchemaRef::new(SchemaBuilder::new("leaf").short("x").byte("y").build().unwrap());
    node.bind(
        SchemaBuilder::new("node")
            .byte("count")
            .unknown("_", 3)
            .nullable_pointer_to("next", &node)
            .array("inline", "count", &leaf)
            .array_pointer("remote", "count", &leaf)
            .word("tag")
            .build()
            .unwrap(),
    )
    .unwrap();
    node
}

fn pair_schema() -> Schema {
    SchemaBuilder::new("pair").pointer("a").nullable_pointer("b").short("k").build().unwrap()
}

/// Random bytes with a sprinkling of pointers into the buffer.
fn rom_bytes() -> impl Strategy<Value = Vec<u8>> {
    (prop::collection::vec(any::<u8>(), 16..512), prop::collection::vec(any::<(usize, usize)>(), 0..32))
        .prop_map(|(mut rom, plants)| {
            let len = rom.len();
            for (at, target) in plants {
                let at = (at % (len - 3)) & !3;
                rom[at..at + 4].copy_from_slice(&to_rom_pointer(target % len).to_le_bytes());
            }
            rom
        })
}

proptest! {
    #[test]
    fn validate_matches_bank_and_range(raw in any::<u32>(), len in 0usize..0x0200_0000) {
        let bank = raw >> 24;
        let offset = (raw & 0x00FF_FFFF) as usize;
        let expected = (bank == 0x08 || bank == 0x09) && offset < len;
        prop_assert_eq!(validate(raw, len).is_ok(), expected);
        if let Ok(resolved) = validate(raw, len) {
            prop_assert_eq!(resolved, offset);
        }
    }

    #[test]
    fn decode_never_panics(rom in rom_bytes(), offset in 0usize..600) {
        let node = node_schema();
        let schema = node.get().unwrap();
        if let Ok(record) = decode(&rom, offset, schema) {
            prop_assert_eq!(record.offset, offset);
            prop_assert!(record.end() <= rom.len());
        }
    }

    #[test]
    fn scalars_read_back(b in any::<u8>(), h in any::<u16>(), w in any::<u32>(), pad in 0usize..8) {
        let schema = SchemaBuilder::new("s").byte("b").short("h").word("w").build().unwrap();
        let mut rom = vec![0xAAu8; pad];
        rom.push(b);
        rom.extend_from_slice(&h.to_le_bytes());
        rom.extend_from_slice(&w.to_le_bytes());

        let record = decode(&rom, pad, &schema).unwrap();
        prop_assert_eq!(record.integer("b"), Some(b as u32));
        prop_assert_eq!(record.integer("h"), Some(h as u32));
        prop_assert_eq!(record.integer("w"), Some(w));
        prop_assert_eq!(record.size, 7);
    }

    #[test]
    fn scan_agrees_with_decode_at_every_candidate(rom in rom_bytes(), align in 1usize..9, chunk in 1usize..256) {
        let schema = pair_schema();
        let scanner = Scanner::new(ScanOptions {
            candidates: romscan::Candidates::Aligned(align),
            chunk_size: chunk,
            ..ScanOptions::default()
        });
        let found: Vec<usize> = scanner.scan(&rom, &schema).offsets().collect();
        let expected: Vec<usize> = (0..rom.len())
            .step_by(align)
            .filter(|&at| decode(&rom, at, &schema).is_ok())
            .collect();
        prop_assert_eq!(found, expected);
    }

    #[test]
    fn default_scan_is_word_aligned(rom in rom_bytes()) {
        let schema = pair_schema();
        for offset in scan(&rom, &schema).offsets() {
            prop_assert_eq!(offset % 4, 0);
        }
    }
}

//! Self-describing wire form of the placement topology
//!
//! Layout: `max_buckets u32 | max_rules u32 | max_devices u32 |
//! device_offload[max_devices] | buckets | rules | optional name
//! tables`. Each bucket slot is 0 for absent or an algorithm tag
//! followed by the common header, items and variant arrays; each rule
//! slot is 0 for absent or a step program. Name tables are ignored on
//! decode and never emitted.

use crate::map::{Bucket, BucketAlg, BucketData, CrushMap, Rule, RuleMask, RuleStep, StepOp};
use strata_common::{Decoder, Encoder, Error, Result};

impl CrushMap {
    /// Encode to the self-describing blob
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(256);
        enc.put_u32(self.buckets.len() as u32);
        enc.put_u32(self.rules.len() as u32);
        enc.put_u32(self.max_devices() as u32);
        for off in &self.device_offload {
            enc.put_u32(*off);
        }

        for slot in &self.buckets {
            match slot {
                None => enc.put_u32(0),
                Some(b) => encode_bucket(&mut enc, b),
            }
        }

        for slot in &self.rules {
            match slot {
                None => enc.put_u32(0),
                Some(r) => encode_rule(&mut enc, r),
            }
        }
        enc.into_bytes()
    }

    /// Decode from the wire blob. Trailing name tables are tolerated
    /// and ignored; any structural problem fails without partial state.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let max_buckets = dec.get_u32()? as usize;
        let max_rules = dec.get_u32()? as usize;
        let max_devices = dec.get_u32()? as usize;

        let mut map = CrushMap::new(max_devices);
        for off in map.device_offload.iter_mut() {
            *off = dec.get_u32()?;
        }

        map.buckets = Vec::with_capacity(max_buckets);
        for _ in 0..max_buckets {
            let tag = dec.get_u32()?;
            if tag == 0 {
                map.buckets.push(None);
                continue;
            }
            map.buckets.push(Some(decode_bucket(&mut dec, tag)?));
        }

        map.rules = Vec::with_capacity(max_rules);
        for _ in 0..max_rules {
            let yes = dec.get_u32()?;
            if yes == 0 {
                map.rules.push(None);
                continue;
            }
            map.rules.push(Some(decode_rule(&mut dec)?));
        }

        map.finalize();
        Ok(map)
    }
}

fn encode_bucket(enc: &mut Encoder, b: &Bucket) {
    let alg = b.data.alg();
    enc.put_u32(alg as u32);
    enc.put_i32(b.id);
    enc.put_u16(b.node_type);
    enc.put_u16(alg as u16);
    enc.put_u32(b.weight);
    enc.put_u32(b.items.len() as u32);
    for item in &b.items {
        enc.put_i32(*item);
    }
    match &b.data {
        BucketData::Uniform {
            primes,
            item_weight,
        } => {
            for p in primes {
                enc.put_u32(*p);
            }
            enc.put_u32(*item_weight);
        }
        BucketData::List {
            item_weights,
            sum_weights,
        } => {
            for (w, s) in item_weights.iter().zip(sum_weights) {
                enc.put_u32(*w);
                enc.put_u32(*s);
            }
        }
        BucketData::Tree { node_weights } => {
            for w in node_weights {
                enc.put_u32(*w);
            }
        }
        BucketData::Straw {
            item_weights,
            straws,
        } => {
            for (w, s) in item_weights.iter().zip(straws) {
                enc.put_u32(*w);
                enc.put_u32(*s);
            }
        }
    }
}

fn decode_bucket(dec: &mut Decoder<'_>, tag: u32) -> Result<Bucket> {
    let id = dec.get_i32()?;
    if id >= 0 {
        return Err(Error::bad_encoding(format!("bucket with device id {id}")));
    }
    let node_type = dec.get_u16()?;
    let alg = BucketAlg::from_wire(u32::from(dec.get_u16()?))?;
    if alg as u32 != tag {
        return Err(Error::bad_encoding(format!(
            "bucket tag {tag} disagrees with alg {alg:?}"
        )));
    }
    let weight = dec.get_u32()?;
    let size = dec.get_u32()? as usize;
    dec.need(size * 4)?;
    let mut items = Vec::with_capacity(size);
    for _ in 0..size {
        items.push(dec.get_i32()?);
    }

    let data = match alg {
        BucketAlg::Uniform => {
            dec.need((size + 1) * 4)?;
            let mut primes = Vec::with_capacity(size);
            for _ in 0..size {
                primes.push(dec.get_u32()?);
            }
            BucketData::Uniform {
                primes,
                item_weight: dec.get_u32()?,
            }
        }
        BucketAlg::List => {
            dec.need(size * 8)?;
            let mut item_weights = Vec::with_capacity(size);
            let mut sum_weights = Vec::with_capacity(size);
            for _ in 0..size {
                item_weights.push(dec.get_u32()?);
                sum_weights.push(dec.get_u32()?);
            }
            BucketData::List {
                item_weights,
                sum_weights,
            }
        }
        BucketAlg::Tree => {
            dec.need(size * 4)?;
            let mut node_weights = Vec::with_capacity(size);
            for _ in 0..size {
                node_weights.push(dec.get_u32()?);
            }
            BucketData::Tree { node_weights }
        }
        BucketAlg::Straw => {
            dec.need(size * 8)?;
            let mut item_weights = Vec::with_capacity(size);
            let mut straws = Vec::with_capacity(size);
            for _ in 0..size {
                item_weights.push(dec.get_u32()?);
                straws.push(dec.get_u32()?);
            }
            BucketData::Straw {
                item_weights,
                straws,
            }
        }
    };

    Ok(Bucket {
        id,
        node_type,
        weight,
        items,
        data,
    })
}

fn encode_rule(enc: &mut Encoder, r: &Rule) {
    enc.put_u32(1);
    enc.put_u32(r.steps.len() as u32);
    enc.put_u8(r.mask.ruleset);
    enc.put_u8(r.mask.rule_type);
    enc.put_u8(r.mask.min_size);
    enc.put_u8(r.mask.max_size);
    for step in &r.steps {
        enc.put_u32(step.op as u32);
        enc.put_i32(step.arg1);
        enc.put_u32(step.arg2);
    }
}

fn decode_rule(dec: &mut Decoder<'_>) -> Result<Rule> {
    let len = dec.get_u32()? as usize;
    let mask = RuleMask {
        ruleset: dec.get_u8()?,
        rule_type: dec.get_u8()?,
        min_size: dec.get_u8()?,
        max_size: dec.get_u8()?,
    };
    dec.need(len * 12)?;
    let mut steps = Vec::with_capacity(len);
    for _ in 0..len {
        let op = StepOp::from_wire(dec.get_u32()?)?;
        let arg1 = dec.get_i32()?;
        let arg2 = dec.get_u32()?;
        steps.push(RuleStep { op, arg1, arg2 });
    }
    Ok(Rule { mask, steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WEIGHT_IN;

    fn sample_map() -> CrushMap {
        let mut map = CrushMap::new(6);
        let u = map
            .add_bucket(
                BucketAlg::Uniform,
                1,
                &[(0, WEIGHT_IN), (1, WEIGHT_IN)],
            )
            .unwrap();
        let l = map
            .add_bucket(BucketAlg::List, 1, &[(2, WEIGHT_IN), (3, 2 * WEIGHT_IN)])
            .unwrap();
        let s = map
            .add_bucket(BucketAlg::Tree, 1, &[(4, WEIGHT_IN), (5, WEIGHT_IN)])
            .unwrap();
        map.add_bucket(
            BucketAlg::Straw,
            2,
            &[(u, 2 * WEIGHT_IN), (l, 3 * WEIGHT_IN), (s, 2 * WEIGHT_IN)],
        )
        .unwrap();
        map.rules.push(None);
        map.add_rule(Rule {
            mask: RuleMask {
                ruleset: 1,
                rule_type: 1,
                min_size: 1,
                max_size: 4,
            },
            steps: vec![
                RuleStep {
                    op: StepOp::Take,
                    arg1: -4,
                    arg2: 0,
                },
                RuleStep {
                    op: StepOp::ChooseLeafFirstn,
                    arg1: 0,
                    arg2: 1,
                },
                RuleStep {
                    op: StepOp::Emit,
                    arg1: 0,
                    arg2: 0,
                },
            ],
        });
        map.device_offload[5] = 0x8000;
        map.finalize();
        map
    }

    #[test]
    fn test_blob_roundtrip() {
        let map = sample_map();
        let bytes = map.encode();
        let back = CrushMap::decode(&bytes).unwrap();
        assert_eq!(back, map);
        // and the re-encoding is byte identical
        assert_eq!(back.encode(), bytes);
    }

    #[test]
    fn test_absent_slots_roundtrip() {
        let mut map = CrushMap::new(1);
        map.buckets.push(None);
        map.rules.push(None);
        let back = CrushMap::decode(&map.encode()).unwrap();
        assert_eq!(back.buckets, vec![None]);
        assert_eq!(back.rules, vec![None]);
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = sample_map().encode();
        for cut in [3, 12, 40, bytes.len() - 1] {
            assert!(
                CrushMap::decode(&bytes[..cut]).is_err(),
                "decode of {cut}-byte prefix should fail"
            );
        }
    }

    #[test]
    fn test_bad_alg_rejected() {
        let map = sample_map();
        let mut bytes = map.encode();
        // corrupt the first bucket's tag
        let off = 12 + map.max_devices() * 4;
        bytes[off] = 0x77;
        assert!(CrushMap::decode(&bytes).is_err());
    }

    #[test]
    fn test_trailing_name_tables_ignored() {
        let map = sample_map();
        let mut bytes = map.encode();
        bytes.extend_from_slice(&[9, 9, 9, 9]);
        let back = CrushMap::decode(&bytes).unwrap();
        assert_eq!(back, map);
    }
}

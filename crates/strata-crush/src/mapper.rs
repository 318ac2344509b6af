//! Rule interpreter: map a key to an ordered target set
//!
//! Pure functions over an immutable [`CrushMap`]; safe to call
//! concurrently. For fixed (map, rule, x, result size, weights) the
//! output is byte-identical across runs and across implementations.

use crate::hash::{hash32_2, hash32_3, hash32_4};
use crate::map::{Bucket, BucketData, CrushMap, StepOp};
use crate::WEIGHT_IN;
use strata_common::{bucket_index, Error, Result};
use tracing::trace;

/// Largest working set carried between rule steps
const MAX_SET: usize = 64;

/// Local retries within one bucket before retrying the whole descent
const LOCAL_RETRIES: i32 = 3;

/// Descent retries before giving up on a replica position
const TOTAL_RETRIES: i32 = 10;

/// Failures tolerated before the retry shift starts advancing
const SHIFT_AFTER: i32 = 4;

impl CrushMap {
    /// True if device `item` is out for input `x` given the in/out
    /// weight vector.
    ///
    /// `weights[item] >= 0x10000` is fully in, 0 is fully out; between,
    /// the device keeps inputs whose `hash(x, item) & 0xffff` falls
    /// below the weight, which makes partial offload stable as the
    /// weight decreases.
    #[must_use]
    pub fn is_out(&self, weights: &[u32], item: u32, x: u32) -> bool {
        let w = weights.get(item as usize).copied().unwrap_or(0);
        if w >= WEIGHT_IN {
            return false;
        }
        if w == 0 {
            return true;
        }
        (hash32_2(x, item) & 0xffff) >= w
    }

    /// Run rule `rule_no` for input `x`, producing an ordered distinct
    /// item set of at most `result_max` entries. `force` pins the first
    /// replica to a device; `weights` is the in/out vector indexed by
    /// device id.
    pub fn do_rule(
        &self,
        rule_no: usize,
        x: u32,
        result_max: usize,
        force: Option<u32>,
        weights: &[u32],
    ) -> Result<Vec<i32>> {
        let rule = self
            .rules
            .get(rule_no)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::not_found(format!("rule {rule_no}")))?;

        let mut result = Vec::new();
        let mut w = vec![0i32; MAX_SET];
        let mut o = vec![0i32; MAX_SET];
        let mut c = vec![0i32; MAX_SET];
        let mut wsize = 0usize;

        // hierarchical context of the forced device, root last popped
        let mut force_context: Vec<i32> = Vec::new();
        if let Some(device) = force {
            if device as usize >= self.max_devices()
                || self.device_parents[device as usize] == 0
            {
                return Err(Error::not_found(format!("forced device {device}")));
            }
            if !self.is_out(weights, device, x) {
                let mut item = device as i32;
                loop {
                    force_context.push(item);
                    item = if item >= 0 {
                        self.device_parents[item as usize]
                    } else {
                        self.bucket_parents[bucket_index(item)]
                    };
                    if item == 0 {
                        break;
                    }
                }
            }
        }

        for step in &rule.steps {
            match step.op {
                StepOp::Take => {
                    w[0] = step.arg1;
                    if let Some(top) = force_context.last() {
                        if *top != w[0] {
                            return Err(Error::fatal(format!(
                                "forced context {top} does not contain take target {}",
                                w[0]
                            )));
                        }
                        force_context.pop();
                    }
                    wsize = 1;
                }
                StepOp::ChooseFirstn
                | StepOp::ChooseIndep
                | StepOp::ChooseLeafFirstn
                | StepOp::ChooseLeafIndep => {
                    if wsize == 0 {
                        return Err(Error::fatal("choose step with empty working set"));
                    }
                    let firstn = step.op.is_firstn();
                    let recurse_to_leaf = step.op.recurses_to_leaf();
                    let mut osize = 0usize;

                    for i in 0..wsize {
                        // non-positive counts are relative to result_max
                        let mut numrep = step.arg1;
                        if numrep <= 0 {
                            numrep += result_max as i32;
                            if numrep <= 0 {
                                continue;
                            }
                        }
                        let numrep = (numrep as usize).min(MAX_SET - osize);
                        let mut j = 0usize;
                        if osize == 0 && !force_context.is_empty() {
                            // skip intermediate types the rule does not name
                            while force_context.len() > 1
                                && force_context.last().is_some_and(|f| {
                                    *f < 0
                                        && self
                                            .bucket(*f)
                                            .is_some_and(|b| u32::from(b.node_type) != step.arg2)
                                })
                            {
                                force_context.pop();
                            }
                            let forced = force_context.pop().unwrap_or(0);
                            o[osize] = forced;
                            if recurse_to_leaf {
                                c[osize] = force.map_or(0, |d| d as i32);
                            }
                            j = 1;
                        }
                        let bucket = self.bucket(w[i]).ok_or_else(|| {
                            Error::fatal(format!("take of missing bucket {}", w[i]))
                        })?;
                        let out2 = if recurse_to_leaf {
                            Some(&mut c[osize..])
                        } else {
                            None
                        };
                        osize += self.choose(
                            bucket,
                            weights,
                            x,
                            numrep,
                            step.arg2,
                            &mut o[osize..],
                            j,
                            firstn,
                            recurse_to_leaf,
                            out2,
                        );
                    }

                    if recurse_to_leaf {
                        // final leaf values replace the interior choices
                        o[..osize].copy_from_slice(&c[..osize]);
                    }
                    std::mem::swap(&mut w, &mut o);
                    wsize = osize;
                }
                StepOp::Emit => {
                    for &item in w.iter().take(wsize) {
                        if result.len() >= result_max {
                            break;
                        }
                        result.push(item);
                    }
                    wsize = 0;
                }
            }
        }
        Ok(result)
    }

    /// Choose `numrep` distinct items of `node_type` starting from
    /// `bucket`, writing into `out[outpos..numrep]`. Returns the final
    /// fill position. With `recurse_to_leaf`, each chosen interior item
    /// is descended to a single device, recorded in `out2`.
    #[allow(clippy::too_many_arguments)]
    fn choose(
        &self,
        bucket: &Bucket,
        weights: &[u32],
        x: u32,
        numrep: usize,
        node_type: u32,
        out: &mut [i32],
        outpos: usize,
        firstn: bool,
        recurse_to_leaf: bool,
        mut out2: Option<&mut [i32]>,
    ) -> usize {
        let mut outpos = outpos;

        for rep in outpos..numrep {
            let mut ftotal = 0i32;
            let mut shift = 0i32;
            let mut skip_rep = false;
            let mut item = 0i32;

            'descent: loop {
                let mut in_bucket = bucket;
                let mut flocal = 0i32;

                'bucket: loop {
                    // modulate the replica position by accumulated
                    // failures so retries explore new draws without
                    // disturbing earlier positions
                    let mut r = rep as i32;
                    if in_bucket.data.alg() == crate::BucketAlg::Uniform {
                        if firstn || numrep >= in_bucket.size() {
                            r += ftotal - shift;
                        } else if in_bucket.size() % numrep == 0 {
                            r += (numrep as i32 + 1) * (flocal + ftotal - shift);
                        } else {
                            r += numrep as i32 * (flocal + ftotal - shift);
                        }
                    } else if firstn {
                        r += ftotal - shift;
                    } else {
                        r += numrep as i32 * (flocal + ftotal - shift);
                    }

                    item = bucket_choose(in_bucket, x, r, shift as usize);

                    let item_type = if item < 0 {
                        match self.bucket(item) {
                            Some(b) => u32::from(b.node_type),
                            None => {
                                skip_rep = true;
                                break 'descent;
                            }
                        }
                    } else {
                        0
                    };

                    if item_type != node_type {
                        // keep descending toward the requested type
                        match self.bucket(item) {
                            Some(b) => {
                                in_bucket = b;
                                continue 'bucket;
                            }
                            None => {
                                skip_rep = true;
                                break 'descent;
                            }
                        }
                    }

                    let collide = out[..outpos].contains(&item);

                    let reject = if recurse_to_leaf && item < 0 {
                        let sub = self.bucket(item).expect("typed item resolves");
                        let leaf = out2.as_deref_mut().expect("leaf output present");
                        self.choose(
                            sub,
                            weights,
                            x,
                            outpos + 1,
                            0,
                            leaf,
                            outpos,
                            firstn,
                            false,
                            None,
                        ) <= outpos
                    } else if node_type == 0 {
                        self.is_out(weights, item as u32, x)
                    } else {
                        false
                    };

                    if !reject && !collide {
                        break 'descent;
                    }

                    ftotal += 1;
                    flocal += 1;
                    if ftotal > SHIFT_AFTER {
                        shift += 1;
                    }
                    trace!(item, reject, collide, ftotal, flocal, shift, "choose retry");

                    if collide && flocal < LOCAL_RETRIES {
                        continue 'bucket; // retry within this bucket
                    } else if ftotal < TOTAL_RETRIES {
                        continue 'descent; // retry the whole descent
                    }
                    skip_rep = true;
                    break 'descent;
                }
            }

            if skip_rep {
                continue;
            }
            out[outpos] = item;
            outpos += 1;
        }

        outpos
    }
}

/// One draw from a bucket for input `x` at replica position `r` with
/// retry shift `shift`.
fn bucket_choose(bucket: &Bucket, x: u32, r: i32, shift: usize) -> i32 {
    let size = bucket.size();
    let id = bucket.id as u32;
    let r = r as u32;
    match &bucket.data {
        BucketData::Uniform { primes, .. } => {
            let o = hash32_2(x, id) & 0xffff;
            // a new prime, hence permutation, every few r
            let oo = hash32_3(r >> 2, id, x);
            let p = primes[(oo as usize) % size];
            let mut s = (x
                .wrapping_add(o)
                .wrapping_add(r.wrapping_add(1).wrapping_mul(p)) as usize)
                % size;
            if shift > 0 {
                s = (s + shift) % size;
            }
            bucket.items[s]
        }
        BucketData::List {
            item_weights,
            sum_weights,
        } => {
            for i in (0..size).rev() {
                let draw = u64::from(hash32_4(x, bucket.items[i] as u32, r, id) & 0xffff);
                let scaled = (draw * u64::from(sum_weights[i])) >> 16;
                if scaled < u64::from(item_weights[i]) {
                    let i = if shift > 0 { (i + shift) % size } else { i };
                    return bucket.items[i];
                }
            }
            bucket.items[0]
        }
        BucketData::Tree { node_weights } => {
            let mut n = size >> 1;
            while n & 1 == 0 {
                // weighted coin flip at each interior node
                let w = node_weights[n];
                let t = (u64::from(hash32_4(x, n as u32, r, id)) * u64::from(w)) >> 32;
                let h = n.trailing_zeros();
                let l = n - (1 << (h - 1));
                n = if t < u64::from(node_weights[l]) {
                    l
                } else {
                    n + (1 << (h - 1))
                };
            }
            let mut n = n;
            if shift > 0 && node_weights.iter().skip(1).step_by(2).any(|w| *w > 0) {
                let mut left = shift;
                while left > 0 {
                    n = (n + 2) % size;
                    if node_weights[n] > 0 {
                        left -= 1;
                    }
                }
            }
            bucket.items[n]
        }
        BucketData::Straw { straws, .. } => {
            let mut high = 0usize;
            let mut high_draw = 0u64;
            for i in 0..size {
                let draw = u64::from(hash32_3(x, bucket.items[i] as u32, r) & 0xffff)
                    * u64::from(straws[i]);
                if i == 0 || draw > high_draw {
                    high = i;
                    high_draw = draw;
                }
            }
            let high = if shift > 0 { (high + shift) % size } else { high };
            bucket.items[high]
        }
    }
}

//! Placement topology: buckets, rules and builder helpers
//!
//! The topology is a DAG of weighted items. Leaves are devices
//! (non-negative ids); interior nodes are buckets (negative ids, with
//! `-1 - id` indexing the bucket array). Each bucket carries one of four
//! selection algorithms; rules are straight-line programs interpreted by
//! [`crate::mapper`].
//!
//! Weights are 16.16 fixed point: `0x10000` is weight 1.0.

use strata_common::{bucket_id, bucket_index, Error, Result};

/// Bucket selection algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketAlg {
    /// Equal-weight children, prime-driven permutation
    Uniform = 1,
    /// Insertion-ordered, cumulative-weight draws
    List = 2,
    /// Balanced binary tree of weight sums
    Tree = 3,
    /// Longest weighted straw wins
    Straw = 4,
}

impl BucketAlg {
    /// Decode from the wire tag
    pub fn from_wire(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Uniform),
            2 => Ok(Self::List),
            3 => Ok(Self::Tree),
            4 => Ok(Self::Straw),
            other => Err(Error::bad_encoding(format!("unknown bucket alg {other}"))),
        }
    }
}

/// Per-algorithm auxiliary data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketData {
    Uniform {
        /// One prime per slot, selected by hash to vary the permutation
        primes: Vec<u32>,
        /// The single per-child weight
        item_weight: u32,
    },
    List {
        item_weights: Vec<u32>,
        /// `sum_weights[i]` covers items `0..=i`
        sum_weights: Vec<u32>,
    },
    Tree {
        /// Node-indexed weights; interior nodes hold subtree sums
        node_weights: Vec<u32>,
    },
    Straw {
        item_weights: Vec<u32>,
        /// Scaled straw lengths, proportional to item weight
        straws: Vec<u32>,
    },
}

impl BucketData {
    /// Matching algorithm tag
    #[must_use]
    pub fn alg(&self) -> BucketAlg {
        match self {
            Self::Uniform { .. } => BucketAlg::Uniform,
            Self::List { .. } => BucketAlg::List,
            Self::Tree { .. } => BucketAlg::Tree,
            Self::Straw { .. } => BucketAlg::Straw,
        }
    }
}

/// An interior node of the topology
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// Negative item id
    pub id: i32,
    /// Level in the hierarchy (device = 0; host/rack/... are map-defined)
    pub node_type: u16,
    /// Total weight, equal to the sum of child weights
    pub weight: u32,
    /// Child item ids. For tree buckets this is node-indexed, with
    /// children at odd slots.
    pub items: Vec<i32>,
    pub data: BucketData,
}

impl Bucket {
    /// Number of item slots
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Child items that are actually populated (skips the interior
    /// slots of tree buckets).
    pub fn children(&self) -> Box<dyn Iterator<Item = i32> + '_> {
        match &self.data {
            BucketData::Tree { node_weights } => Box::new(
                self.items
                    .iter()
                    .enumerate()
                    .filter(move |(i, _)| i % 2 == 1 && node_weights[*i] > 0)
                    .map(|(_, item)| *item),
            ),
            _ => Box::new(self.items.iter().copied()),
        }
    }
}

/// Rule applicability mask
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuleMask {
    pub ruleset: u8,
    pub rule_type: u8,
    pub min_size: u8,
    pub max_size: u8,
}

/// Rule step opcodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOp {
    Take = 1,
    ChooseFirstn = 2,
    ChooseIndep = 3,
    Emit = 4,
    ChooseLeafFirstn = 6,
    ChooseLeafIndep = 7,
}

impl StepOp {
    pub fn from_wire(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Take),
            2 => Ok(Self::ChooseFirstn),
            3 => Ok(Self::ChooseIndep),
            4 => Ok(Self::Emit),
            6 => Ok(Self::ChooseLeafFirstn),
            7 => Ok(Self::ChooseLeafIndep),
            other => Err(Error::bad_encoding(format!("unknown rule op {other}"))),
        }
    }

    /// True for the first-n opcode family
    #[must_use]
    pub fn is_firstn(&self) -> bool {
        matches!(self, Self::ChooseFirstn | Self::ChooseLeafFirstn)
    }

    /// True for the recurse-to-leaf opcode family
    #[must_use]
    pub fn recurses_to_leaf(&self) -> bool {
        matches!(self, Self::ChooseLeafFirstn | Self::ChooseLeafIndep)
    }
}

/// One rule step. `arg1` is the take root or the choose count
/// (non-positive counts are relative to the requested result size);
/// `arg2` is the node type to select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleStep {
    pub op: StepOp,
    pub arg1: i32,
    pub arg2: u32,
}

/// A placement rule: a straight-line program over the topology
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub mask: RuleMask,
    pub steps: Vec<RuleStep>,
}

/// The complete placement topology
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrushMap {
    pub buckets: Vec<Option<Bucket>>,
    pub rules: Vec<Option<Rule>>,
    /// Per-device in/out weight; `0x10000` fully in, 0 fully out
    pub device_offload: Vec<u32>,
    /// Containing bucket of each device (0 = none); filled by `finalize`
    pub device_parents: Vec<i32>,
    /// Containing bucket of each bucket (0 = none); filled by `finalize`
    pub bucket_parents: Vec<i32>,
}

impl CrushMap {
    /// Empty topology with room for `max_devices` devices, all fully in
    #[must_use]
    pub fn new(max_devices: usize) -> Self {
        Self {
            buckets: Vec::new(),
            rules: Vec::new(),
            device_offload: vec![crate::WEIGHT_IN; max_devices],
            device_parents: vec![0; max_devices],
            bucket_parents: Vec::new(),
        }
    }

    #[must_use]
    pub fn max_devices(&self) -> usize {
        self.device_offload.len()
    }

    /// Look up a bucket by (negative) item id
    #[must_use]
    pub fn bucket(&self, id: i32) -> Option<&Bucket> {
        if id >= 0 {
            return None;
        }
        self.buckets.get(bucket_index(id))?.as_ref()
    }

    /// Add a bucket built from `(item, weight)` pairs; returns its id.
    ///
    /// Uniform buckets require equal weights. Tree buckets are laid out
    /// as a complete binary tree with children at odd node slots.
    pub fn add_bucket(
        &mut self,
        alg: BucketAlg,
        node_type: u16,
        items: &[(i32, u32)],
    ) -> Result<i32> {
        if items.is_empty() {
            return Err(Error::fatal("bucket with no items"));
        }
        let id = bucket_id(self.buckets.len());
        let weight: u32 = items.iter().map(|(_, w)| *w).sum();
        let bucket = match alg {
            BucketAlg::Uniform => {
                let item_weight = items[0].1;
                if items.iter().any(|(_, w)| *w != item_weight) {
                    return Err(Error::fatal("uniform bucket with unequal weights"));
                }
                Bucket {
                    id,
                    node_type,
                    weight,
                    items: items.iter().map(|(i, _)| *i).collect(),
                    data: BucketData::Uniform {
                        primes: primes_for(items.len()),
                        item_weight,
                    },
                }
            }
            BucketAlg::List => {
                let item_weights: Vec<u32> = items.iter().map(|(_, w)| *w).collect();
                let mut sum = 0u32;
                let sum_weights = item_weights
                    .iter()
                    .map(|w| {
                        sum = sum.wrapping_add(*w);
                        sum
                    })
                    .collect();
                Bucket {
                    id,
                    node_type,
                    weight,
                    items: items.iter().map(|(i, _)| *i).collect(),
                    data: BucketData::List {
                        item_weights,
                        sum_weights,
                    },
                }
            }
            BucketAlg::Tree => {
                let leaves = items.len().next_power_of_two();
                let nodes = leaves * 2;
                let mut node_items = vec![0i32; nodes];
                let mut node_weights = vec![0u32; nodes];
                for (j, (item, w)) in items.iter().enumerate() {
                    node_items[2 * j + 1] = *item;
                    node_weights[2 * j + 1] = *w;
                }
                // interior weights are subtree sums, built bottom-up;
                // node x at height h covers leaves in (x - 2^h, x + 2^h)
                let mut h = 1;
                while (1 << h) < nodes {
                    let span = 1usize << (h - 1);
                    let mut x = 1 << h;
                    while x < nodes {
                        node_weights[x] = node_weights[x - span] + node_weights[x + span];
                        x += 1 << (h + 1);
                    }
                    h += 1;
                }
                Bucket {
                    id,
                    node_type,
                    weight,
                    items: node_items,
                    data: BucketData::Tree { node_weights },
                }
            }
            BucketAlg::Straw => {
                let item_weights: Vec<u32> = items.iter().map(|(_, w)| *w).collect();
                let straws = item_weights.clone();
                Bucket {
                    id,
                    node_type,
                    weight,
                    items: items.iter().map(|(i, _)| *i).collect(),
                    data: BucketData::Straw {
                        item_weights,
                        straws,
                    },
                }
            }
        };
        self.buckets.push(Some(bucket));
        Ok(id)
    }

    /// Add a rule; returns its rule number
    pub fn add_rule(&mut self, rule: Rule) -> usize {
        self.rules.push(Some(rule));
        self.rules.len() - 1
    }

    /// Find a rule matching a ruleset, type and output size
    #[must_use]
    pub fn find_rule(&self, ruleset: u8, rule_type: u8, size: u8) -> Option<usize> {
        self.rules.iter().position(|r| {
            r.as_ref().is_some_and(|r| {
                r.mask.ruleset == ruleset
                    && r.mask.rule_type == rule_type
                    && r.mask.min_size <= size
                    && r.mask.max_size >= size
            })
        })
    }

    /// Rebuild the parent tables. Must be called after topology edits
    /// before mapping with a forced first replica.
    pub fn finalize(&mut self) {
        self.device_parents = vec![0; self.max_devices()];
        self.bucket_parents = vec![0; self.buckets.len()];
        for slot in self.buckets.iter().flatten() {
            for item in slot.children() {
                if item >= 0 {
                    if let Some(p) = self.device_parents.get_mut(item as usize) {
                        *p = slot.id;
                    }
                } else if let Some(p) = self.bucket_parents.get_mut(bucket_index(item)) {
                    *p = slot.id;
                }
            }
        }
    }

    /// Validate the structural invariants: bucket weights equal child
    /// sums, and every child id resolves.
    pub fn check(&self) -> Result<()> {
        for bucket in self.buckets.iter().flatten() {
            let mut sum = 0u64;
            for item in bucket.children() {
                if item >= 0 {
                    if item as usize >= self.max_devices() {
                        return Err(Error::fatal(format!(
                            "bucket {} references device {item} out of range",
                            bucket.id
                        )));
                    }
                    sum += u64::from(self.child_weight(bucket, item));
                } else {
                    let child = self.bucket(item).ok_or_else(|| {
                        Error::fatal(format!(
                            "bucket {} references missing bucket {item}",
                            bucket.id
                        ))
                    })?;
                    sum += u64::from(child.weight);
                    if self.child_weight(bucket, item) != child.weight {
                        return Err(Error::fatal(format!(
                            "bucket {} carries stale weight for child {item}",
                            bucket.id
                        )));
                    }
                }
            }
            if sum != u64::from(bucket.weight) {
                return Err(Error::fatal(format!(
                    "bucket {} weight {} != child sum {sum}",
                    bucket.id, bucket.weight
                )));
            }
        }
        Ok(())
    }

    /// The weight a bucket assigns to one of its children
    fn child_weight(&self, bucket: &Bucket, item: i32) -> u32 {
        match &bucket.data {
            BucketData::Uniform { item_weight, .. } => *item_weight,
            BucketData::List { item_weights, .. } | BucketData::Straw { item_weights, .. } => {
                bucket
                    .items
                    .iter()
                    .position(|i| *i == item)
                    .map_or(0, |p| item_weights[p])
            }
            BucketData::Tree { node_weights } => bucket
                .items
                .iter()
                .enumerate()
                .find(|(p, i)| p % 2 == 1 && **i == item && node_weights[*p] > 0)
                .map_or(0, |(p, _)| node_weights[p]),
        }
    }
}

/// First `n` primes at or above `n.max(3)`, for uniform permutations
fn primes_for(n: usize) -> Vec<u32> {
    let mut primes = Vec::with_capacity(n);
    let mut candidate = (n as u32).max(3) | 1;
    while primes.len() < n {
        if is_prime(candidate) {
            primes.push(candidate);
        }
        candidate += 2;
    }
    primes
}

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::index::{extract_kv_pairs, tokenize};
use crate::store::Record;

/// The six indexes built over a sealed chunk, plus the attribute-key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKind {
    Token,
    AttrKey,
    AttrVal,
    AttrKv,
    KvKey,
    KvVal,
    KvKv,
}

impl IndexKind {
    pub const ALL: [IndexKind; 7] = [
        IndexKind::Token,
        IndexKind::AttrKey,
        IndexKind::AttrVal,
        IndexKind::AttrKv,
        IndexKind::KvKey,
        IndexKind::KvVal,
        IndexKind::KvKv,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::Token => "token",
            IndexKind::AttrKey => "attr_key",
            IndexKind::AttrVal => "attr_val",
            IndexKind::AttrKv => "attr_kv",
            IndexKind::KvKey => "kv_key",
            IndexKind::KvVal => "kv_val",
            IndexKind::KvKv => "kv_kv",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.idx", self.name())
    }

    pub fn from_name(name: &str) -> Option<IndexKind> {
        IndexKind::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Whether this index is subject to the kv extraction budget.
    pub fn budgeted(&self) -> bool {
        matches!(self, IndexKind::KvKey | IndexKind::KvVal | IndexKind::KvKv)
    }
}

/// Key of one index entry. Single-dimension indexes (token, attr_key, ...)
/// leave `value` empty; the pair indexes use both fields.
pub type EntryKey = (String, String);

/// One index: sorted entry map plus the capped flag. The BTreeMap keeps
/// iteration (and therefore the file encoding) deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexData {
    pub entries: BTreeMap<EntryKey, Vec<u64>>,
    pub capped: bool,
}

impl IndexData {
    pub fn lookup(&self, key: &str, value: &str) -> Option<&[u64]> {
        self.entries
            .get(&(key.to_owned(), value.to_owned()))
            .map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rough in-memory footprint, reported for memory vaults where there
    /// is no file size to point at.
    pub fn approx_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|((k, v), positions)| (k.len() + v.len() + 8 * positions.len() + 16) as u64)
            .sum()
    }

    fn add(&mut self, key: EntryKey, position: u64) {
        let positions = self.entries.entry(key).or_insert_with(Vec::new);
        if positions.last() != Some(&position) {
            positions.push(position);
        }
    }
}

/// Builds all indexes of one chunk in a single pass over its records.
///
/// Records must be fed in position order; the builder relies on that to
/// keep position lists sorted without a final sort pass.
pub struct IndexSetBuilder {
    token: IndexData,
    attr_key: IndexData,
    attr_val: IndexData,
    attr_kv: IndexData,
    kv_key: IndexData,
    kv_val: IndexData,
    kv_kv: IndexData,
    kv_budget: usize,
    kv_entries: usize,
}

impl IndexSetBuilder {
    pub fn new(kv_budget: usize) -> IndexSetBuilder {
        IndexSetBuilder {
            token: IndexData::default(),
            attr_key: IndexData::default(),
            attr_val: IndexData::default(),
            attr_kv: IndexData::default(),
            kv_key: IndexData::default(),
            kv_val: IndexData::default(),
            kv_kv: IndexData::default(),
            kv_budget,
            kv_entries: 0,
        }
    }

    pub fn add_record(&mut self, position: u64, rec: &Record) {
        for token in tokenize(&rec.raw) {
            self.token.add((token, String::new()), position);
        }

        for (key, value) in &rec.attrs {
            self.attr_key.add((key.clone(), String::new()), position);
            self.attr_val.add((value.clone(), String::new()), position);
            self.attr_kv.add((key.clone(), value.clone()), position);
        }

        for (key, value) in extract_kv_pairs(&rec.raw) {
            Self::add_budgeted(
                &mut self.kv_key,
                (key.clone(), String::new()),
                position,
                self.kv_budget,
                &mut self.kv_entries,
            );
            Self::add_budgeted(
                &mut self.kv_val,
                (value.clone(), String::new()),
                position,
                self.kv_budget,
                &mut self.kv_entries,
            );
            Self::add_budgeted(
                &mut self.kv_kv,
                (key, value),
                position,
                self.kv_budget,
                &mut self.kv_entries,
            );
        }

        // a cap on any kv index caps the whole extraction set
        if self.kv_key.capped || self.kv_val.capped || self.kv_kv.capped {
            self.kv_key.capped = true;
            self.kv_val.capped = true;
            self.kv_kv.capped = true;
        }
    }

    /// Budgeted insert: known entries keep accumulating positions, but a
    /// new unique entry past the budget is dropped and caps the index.
    fn add_budgeted(
        data: &mut IndexData,
        key: EntryKey,
        position: u64,
        budget: usize,
        used: &mut usize,
    ) {
        if data.entries.contains_key(&key) {
            data.add(key, position);
            return;
        }
        if *used >= budget {
            if !data.capped {
                log::debug!("kv index budget exhausted, capping");
                data.capped = true;
            }
            return;
        }
        data.add(key, position);
        *used += 1;
    }

    pub fn finish(self) -> BTreeMap<IndexKind, IndexData> {
        let mut out = BTreeMap::new();
        out.insert(IndexKind::Token, self.token);
        out.insert(IndexKind::AttrKey, self.attr_key);
        out.insert(IndexKind::AttrVal, self.attr_val);
        out.insert(IndexKind::AttrKv, self.attr_kv);
        out.insert(IndexKind::KvKey, self.kv_key);
        out.insert(IndexKind::KvVal, self.kv_val);
        out.insert(IndexKind::KvKv, self.kv_kv);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(raw: &str) -> Record {
        Record::new(raw.as_bytes().to_vec())
    }

    #[test]
    fn builds_all_shapes() {
        let mut b = IndexSetBuilder::new(100);
        let mut r0 = rec("user login ok user=alice");
        r0.attrs.insert("host".into(), "web1".into());
        b.add_record(0, &r0);
        b.add_record(1, &rec("error network"));

        let indexes = b.finish();

        let token = &indexes[&IndexKind::Token];
        assert_eq!(token.lookup("user", "").unwrap(), &[0]);
        assert_eq!(token.lookup("error", "").unwrap(), &[1]);
        assert!(token.lookup("missing", "").is_none());

        let attr_kv = &indexes[&IndexKind::AttrKv];
        assert_eq!(attr_kv.lookup("host", "web1").unwrap(), &[0]);

        let kv_kv = &indexes[&IndexKind::KvKv];
        assert_eq!(kv_kv.lookup("user", "alice").unwrap(), &[0]);
        assert!(!kv_kv.capped);
    }

    #[test]
    fn positions_stay_sorted_and_unique() {
        let mut b = IndexSetBuilder::new(100);
        for pos in 0..5 {
            b.add_record(pos, &rec("same same same"));
        }
        let indexes = b.finish();
        assert_eq!(
            indexes[&IndexKind::Token].lookup("same", "").unwrap(),
            &[0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn budget_caps_kv_indexes_only() {
        let mut b = IndexSetBuilder::new(3);
        b.add_record(0, &rec("a=1"));      // kv entries: a, 1, (a,1)
        b.add_record(1, &rec("b=2 c=3")); // over budget
        let indexes = b.finish();

        assert!(indexes[&IndexKind::KvKey].capped);
        assert!(indexes[&IndexKind::KvVal].capped);
        assert!(indexes[&IndexKind::KvKv].capped);
        assert!(!indexes[&IndexKind::Token].capped);

        // entries admitted before the cap still accumulate positions
        assert_eq!(indexes[&IndexKind::KvKv].lookup("a", "1").unwrap(), &[0]);
        assert!(indexes[&IndexKind::KvKv].lookup("b", "2").is_none());
    }

    #[test]
    fn deterministic_output() {
        let build = || {
            let mut b = IndexSetBuilder::new(100);
            b.add_record(0, &rec("x=1 y=2 common"));
            b.add_record(1, &rec("y=2 z=3 common"));
            b.finish()
        };
        assert_eq!(build(), build());
    }
}

//! Typed facade over the byte-keyed B+-tree: binds an index definition to
//! its `.idx` file, encodes values into order-preserving keys, and
//! enforces the UNIQUE constraint.

use std::path::Path;

use strata::btree::BTree;
use strata::errors::IndexError;
use strata::Rid;

use crate::catalog::IndexInfo;
use crate::errors::DbResult;
use crate::keycodec::{decode_key, encode_key};
use crate::types::Value;

pub struct Index {
    info: IndexInfo,
    tree: BTree,
}

impl Index {
    pub fn create(data_dir: &Path, info: IndexInfo) -> DbResult<Self> {
        let tree = BTree::create(data_dir.join(&info.file), info.key_type.tag())?;
        Ok(Self { info, tree })
    }

    pub fn open(data_dir: &Path, info: IndexInfo) -> DbResult<Self> {
        let tree = BTree::open(data_dir.join(&info.file))?;
        if tree.key_type() != info.key_type.tag() {
            return Err(IndexError::CorruptIndex(format!(
                "index '{}' key type tag {} does not match catalog",
                info.name,
                tree.key_type()
            ))
            .into());
        }
        Ok(Self { info, tree })
    }

    pub fn info(&self) -> &IndexInfo {
        &self.info
    }

    /// Add an entry. NULL keys are the caller's responsibility to skip.
    pub fn insert(&self, value: &Value, rid: Rid) -> DbResult<()> {
        let key = encode_key(value, self.info.key_type)?;
        self.tree.insert(&key, rid, self.info.unique)?;
        Ok(())
    }

    pub fn delete(&self, value: &Value, rid: Rid) -> DbResult<bool> {
        let key = encode_key(value, self.info.key_type)?;
        Ok(self.tree.delete(&key, rid)?)
    }

    /// All RIDs stored under `value` (at most one for a UNIQUE index).
    pub fn search(&self, value: &Value) -> DbResult<Vec<Rid>> {
        let key = encode_key(value, self.info.key_type)?;
        Ok(self.tree.search_all(&key)?)
    }

    pub fn contains(&self, value: &Value) -> DbResult<bool> {
        let key = encode_key(value, self.info.key_type)?;
        Ok(self.tree.contains_key(&key)?)
    }

    /// Ascending range scan; each bound is `(value, inclusive)` and `None`
    /// leaves that end open.
    pub fn range(
        &self,
        lo: Option<(&Value, bool)>,
        hi: Option<(&Value, bool)>,
    ) -> DbResult<Vec<(Value, Rid)>> {
        let lo_key = match lo {
            Some((v, incl)) => Some((encode_key(v, self.info.key_type)?, incl)),
            None => None,
        };
        let hi_key = match hi {
            Some((v, incl)) => Some((encode_key(v, self.info.key_type)?, incl)),
            None => None,
        };

        let mut out = Vec::new();
        let scan = self.tree.range(
            lo_key.as_ref().map(|(k, incl)| (k.as_slice(), *incl)),
            hi_key.as_ref().map(|(k, incl)| (k.as_slice(), *incl)),
        );
        for entry in scan {
            let (key, rid) = entry?;
            out.push((decode_key(&key, self.info.key_type)?, rid));
        }
        Ok(out)
    }

    pub fn flush(&self) -> DbResult<()> {
        self.tree.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn check_invariants(&self) -> DbResult<Vec<String>> {
        Ok(self.tree.check_invariants()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DbError;
    use crate::types::DataType;
    use tempfile::tempdir;

    fn info(unique: bool) -> IndexInfo {
        IndexInfo {
            name: "ix_t_name".into(),
            table: "t".into(),
            column: 1,
            key_type: DataType::String,
            unique,
            file: "ix_t_name.idx".into(),
        }
    }

    #[test]
    fn typed_round_trip_and_range() {
        let dir = tempdir().unwrap();
        let index = Index::create(dir.path(), info(false)).unwrap();
        for (i, name) in ["cherry", "apple", "banana", "apple"].iter().enumerate() {
            index
                .insert(&Value::Str(name.to_string()), Rid::new(1, i as u16))
                .unwrap();
        }

        assert_eq!(
            index.search(&Value::Str("apple".into())).unwrap(),
            vec![Rid::new(1, 1), Rid::new(1, 3)]
        );

        let hits = index
            .range(
                Some((&Value::Str("apple".into()), true)),
                Some((&Value::Str("banana".into()), true)),
            )
            .unwrap();
        let names: Vec<String> = hits
            .iter()
            .map(|(v, _)| match v {
                Value::Str(s) => s.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["apple", "apple", "banana"]);
    }

    #[test]
    fn unique_violations_surface_as_duplicate_key() {
        let dir = tempdir().unwrap();
        let index = Index::create(dir.path(), info(true)).unwrap();
        index
            .insert(&Value::Str("solo".into()), Rid::new(1, 0))
            .unwrap();
        assert!(matches!(
            index.insert(&Value::Str("solo".into()), Rid::new(1, 1)),
            Err(DbError::Index(IndexError::DuplicateKey))
        ));
    }

    #[test]
    fn wrong_key_type_is_rejected() {
        let dir = tempdir().unwrap();
        let index = Index::create(dir.path(), info(false)).unwrap();
        assert!(matches!(
            index.insert(&Value::Int(3), Rid::new(1, 0)),
            Err(DbError::KeyTypeMismatch { .. })
        ));
        assert!(matches!(
            index.insert(&Value::Null, Rid::new(1, 0)),
            Err(DbError::NullKey)
        ));
    }

    #[test]
    fn reopen_checks_key_type_tag() {
        let dir = tempdir().unwrap();
        {
            Index::create(dir.path(), info(false)).unwrap();
        }
        let mut wrong = info(false);
        wrong.key_type = DataType::Int;
        assert!(Index::open(dir.path(), wrong).is_err());
        assert!(Index::open(dir.path(), info(false)).is_ok());
    }
}

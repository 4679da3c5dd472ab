//! Data pools: dispensers of journey argument tuples.
//!
//! Two flavors. *Recyclable* pools have a fixed population whose items cycle
//! between available and checked-out; they never exhaust unless closed.
//! *Iterable* pools hand each item out once and exhaust at the end of the
//! sequence. Pools live inside the scenario manager; runners only ever see
//! `(data_id, data)` pairs loaned through work grants.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

/// Errors building a pool from an external source.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to open data file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV file has no headers")]
    NoHeaders,

    #[error("data source is empty")]
    EmptyData,
}

/// A single loanable argument tuple. `id` is unique per pool per lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoolItem {
    pub id: u64,
    pub data: Value,
}

/// Outcome of a checkout attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Checkout {
    /// An item, now loaned out until checked back in.
    Item(DataPoolItem),
    /// Nothing available right now (recyclable pool, all items out).
    /// The scenario keeps running and should try again later.
    Empty,
    /// The pool is finished; the scenario must be removed.
    Exhausted,
}

pub trait DataPool: Send {
    fn checkout(&mut self) -> Checkout;

    fn checkin(&mut self, id: u64);

    /// Total population, if the pool has a fixed one.
    fn size(&self) -> Option<usize>;
}

/// Fixed population of items cycling between available and checked-out.
pub struct RecyclablePool {
    available: VecDeque<DataPoolItem>,
    checked_out: HashMap<u64, Value>,
    closed: bool,
}

impl RecyclablePool {
    pub fn new(items: impl IntoIterator<Item = Value>) -> Self {
        let available: VecDeque<_> = items
            .into_iter()
            .enumerate()
            .map(|(i, data)| DataPoolItem {
                id: i as u64 + 1,
                data,
            })
            .collect();
        RecyclablePool {
            available,
            checked_out: HashMap::new(),
            closed: false,
        }
    }

    /// Signal external exhaustion: subsequent checkouts report `Exhausted`.
    /// Items still on loan are considered lost.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.checked_out.len()
    }
}

impl DataPool for RecyclablePool {
    fn checkout(&mut self) -> Checkout {
        if self.closed {
            return Checkout::Exhausted;
        }
        match self.available.pop_front() {
            Some(item) => {
                self.checked_out.insert(item.id, item.data.clone());
                Checkout::Item(item)
            }
            None => Checkout::Empty,
        }
    }

    fn checkin(&mut self, id: u64) {
        if let Some(data) = self.checked_out.remove(&id) {
            self.available.push_back(DataPoolItem { id, data });
        }
    }

    fn size(&self) -> Option<usize> {
        Some(self.available.len() + self.checked_out.len())
    }
}

/// One-shot pool over a sequence; exhausts when the sequence ends.
pub struct IterablePool {
    items: Box<dyn Iterator<Item = Value> + Send>,
    next_id: u64,
}

impl IterablePool {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        IterablePool {
            items: Box::new(items.into_iter()),
            next_id: 0,
        }
    }
}

impl DataPool for IterablePool {
    fn checkout(&mut self) -> Checkout {
        match self.items.next() {
            Some(data) => {
                self.next_id += 1;
                Checkout::Item(DataPoolItem {
                    id: self.next_id,
                    data,
                })
            }
            None => Checkout::Exhausted,
        }
    }

    fn checkin(&mut self, _id: u64) {}

    fn size(&self) -> Option<usize> {
        None
    }
}

/// Parse a headered CSV into one JSON object per row, keyed by column name.
fn csv_rows<R: Read>(reader: R) -> Result<Vec<Value>, PoolError> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    if headers.is_empty() {
        return Err(PoolError::NoHeaders);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Map::new();
        for (i, header) in headers.iter().enumerate() {
            if let Some(value) = record.get(i) {
                row.insert(header.clone(), Value::String(value.to_string()));
            }
        }
        rows.push(Value::Object(row));
    }
    if rows.is_empty() {
        return Err(PoolError::EmptyData);
    }
    Ok(rows)
}

/// Recyclable pool from a headered CSV file.
pub fn recyclable_from_csv<P: AsRef<Path>>(path: P) -> Result<RecyclablePool, PoolError> {
    let rows = csv_rows(File::open(path.as_ref())?)?;
    info!(path = ?path.as_ref(), rows = rows.len(), "loaded recyclable CSV data pool");
    Ok(RecyclablePool::new(rows))
}

/// Iterable (one-shot) pool from a headered CSV file.
pub fn iterable_from_csv<P: AsRef<Path>>(path: P) -> Result<IterablePool, PoolError> {
    let rows = csv_rows(File::open(path.as_ref())?)?;
    info!(path = ?path.as_ref(), rows = rows.len(), "loaded iterable CSV data pool");
    Ok(IterablePool::new(rows))
}

/// Recyclable pool from raw CSV content (used by tests).
pub fn recyclable_from_csv_str(content: &str) -> Result<RecyclablePool, PoolError> {
    Ok(RecyclablePool::new(csv_rows(content.as_bytes())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_CSV: &str = "username,password\nuser1,pass1\nuser2,pass2\nuser3,pass3\n";

    #[test]
    fn recyclable_cycles_items() {
        let mut pool = RecyclablePool::new(vec![json!(1), json!(2)]);
        let a = match pool.checkout() {
            Checkout::Item(item) => item,
            other => panic!("unexpected {:?}", other),
        };
        let b = match pool.checkout() {
            Checkout::Item(item) => item,
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(a.id, b.id);
        assert_eq!(pool.checkout(), Checkout::Empty);

        pool.checkin(a.id);
        match pool.checkout() {
            Checkout::Item(item) => assert_eq!(item.id, a.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn recyclable_conserves_population() {
        let mut pool = RecyclablePool::new((0..5).map(|i| json!(i)));
        let mut out = Vec::new();
        for _ in 0..3 {
            if let Checkout::Item(item) = pool.checkout() {
                out.push(item.id);
            }
        }
        assert_eq!(pool.available_count() + pool.checked_out_count(), 5);
        for id in out {
            pool.checkin(id);
        }
        assert_eq!(pool.available_count(), 5);
        assert_eq!(pool.checked_out_count(), 0);
    }

    #[test]
    fn recyclable_close_signals_exhaustion() {
        let mut pool = RecyclablePool::new(vec![json!("x")]);
        pool.close();
        assert_eq!(pool.checkout(), Checkout::Exhausted);
    }

    #[test]
    fn iterable_exhausts_at_end() {
        let mut pool = IterablePool::new(vec![json!("a"), json!("b")]);
        let ids: Vec<u64> = (0..2)
            .map(|_| match pool.checkout() {
                Checkout::Item(item) => item.id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(pool.checkout(), Checkout::Exhausted);
        // checkin on an iterable pool is a no-op
        pool.checkin(1);
        assert_eq!(pool.checkout(), Checkout::Exhausted);
    }

    #[test]
    fn csv_rows_become_objects() {
        let mut pool = recyclable_from_csv_str(TEST_CSV).unwrap();
        assert_eq!(pool.size(), Some(3));
        match pool.checkout() {
            Checkout::Item(item) => {
                assert_eq!(item.data["username"], "user1");
                assert_eq!(item.data["password"], "pass1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_csv_rejected() {
        assert!(matches!(
            recyclable_from_csv_str("a,b\n"),
            Err(PoolError::EmptyData)
        ));
    }
}

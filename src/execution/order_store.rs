/// In-memory registry of active conditional orders, grouped per instrument

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tracing::debug;

use crate::core::Instrument;
use super::condition::{Condition, ConditionalOrder, OrderId};
use super::OrderError;

/// Orders for one instrument, in insertion order
pub type OrderBook = Arc<RwLock<Vec<ConditionalOrder>>>;

#[derive(Debug, Default)]
pub struct OrderStore {
    books: DashMap<Instrument, OrderBook>,
    index: DashMap<OrderId, Instrument>,
}

pub(crate) fn read_book(book: &OrderBook) -> RwLockReadGuard<'_, Vec<ConditionalOrder>> {
    book.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_book(book: &OrderBook) -> RwLockWriteGuard<'_, Vec<ConditionalOrder>> {
    book.write().unwrap_or_else(PoisonError::into_inner)
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append an order to its instrument's book
    pub fn insert(&self, order: ConditionalOrder) -> Result<OrderId, OrderError> {
        order.validate()?;

        let id = order.id;
        // Index first so a concurrent trigger can always find and clear it
        self.index.insert(id, order.instrument.clone());

        // Push under the map entry so an empty book cannot be pruned in between
        let book = self.books.entry(order.instrument.clone()).or_default();
        write_book(book.value()).push(order);
        drop(book);

        debug!(order_id = %id, "Order inserted");
        Ok(id)
    }

    /// Remove an order. Returns true only if this call removed it.
    pub fn cancel(&self, id: &OrderId) -> bool {
        let Some((_, instrument)) = self.index.remove(id) else {
            return false;
        };
        let Some(book) = self.book(&instrument) else {
            return false;
        };

        let removed = {
            let mut orders = write_book(&book);
            match orders.iter().position(|o| &o.id == id) {
                Some(idx) => {
                    orders.remove(idx);
                    true
                }
                None => false,
            }
        };
        self.prune(&instrument);
        removed
    }

    pub fn update_condition(&self, id: &OrderId, condition: Condition) -> Result<(), OrderError> {
        condition.validate()?;

        let instrument = self
            .index
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(OrderError::OrderNotFound(*id))?;
        let book = self.book(&instrument).ok_or(OrderError::OrderNotFound(*id))?;

        let mut orders = write_book(&book);
        let order = orders
            .iter_mut()
            .find(|o| &o.id == id)
            .ok_or(OrderError::OrderNotFound(*id))?;
        order.condition = condition;
        Ok(())
    }

    pub fn get(&self, id: &OrderId) -> Option<ConditionalOrder> {
        let instrument = self.index.get(id)?.value().clone();
        let book = self.book(&instrument)?;
        let orders = read_book(&book);
        orders.iter().find(|o| &o.id == id).cloned()
    }

    /// Point-in-time copy of every active order
    pub fn snapshot(&self) -> Vec<ConditionalOrder> {
        self.books_with_orders()
            .into_iter()
            .flat_map(|(_, book)| {
                let orders = read_book(&book).clone();
                orders
            })
            .collect()
    }

    pub fn book(&self, instrument: &str) -> Option<OrderBook> {
        self.books.get(instrument).map(|entry| entry.value().clone())
    }

    /// Handles to every non-empty book. The map is not locked once this returns.
    pub fn books_with_orders(&self) -> Vec<(Instrument, OrderBook)> {
        let handles: Vec<(Instrument, OrderBook)> = self
            .books
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        handles
            .into_iter()
            .filter(|(_, book)| !read_book(book).is_empty())
            .collect()
    }

    /// Remove an instrument's book once it holds no orders
    pub(crate) fn prune(&self, instrument: &str) {
        if self.books.remove_if(instrument, |_, book| read_book(book).is_empty()).is_some() {
            debug!(instrument = instrument, "Empty order book removed");
        }
    }

    pub fn instrument_count(&self) -> usize {
        self.books.len()
    }

    /// Drop index entries for orders already taken out of their book
    pub(crate) fn forget(&self, ids: &[OrderId]) {
        for id in ids {
            self.index.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::condition::{AmountPolicy, OrderAction};
    use std::thread;

    fn stop(instrument: &str, price: f64) -> ConditionalOrder {
        ConditionalOrder::new(instrument, Condition::stop_loss(price), OrderAction::sell("USDC"), AmountPolicy::FullPosition)
    }

    #[test]
    fn test_insert_preserves_order_per_instrument() {
        let store = OrderStore::new();
        let first = store.insert(stop("SOL", 90.0)).unwrap();
        let second = store.insert(stop("SOL", 80.0)).unwrap();
        store.insert(stop("BONK", 0.001)).unwrap();

        let book = store.book("SOL").unwrap();
        let ids: Vec<OrderId> = read_book(&book).iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_invalid_order_is_never_stored() {
        let store = OrderStore::new();
        let result = store.insert(stop("SOL", -1.0));
        assert!(matches!(result, Err(OrderError::InvalidOrderParameter(_))));
        assert!(store.is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_cancel_unknown_returns_false() {
        let store = OrderStore::new();
        assert!(!store.cancel(&uuid::Uuid::new_v4()));

        let id = store.insert(stop("SOL", 90.0)).unwrap();
        assert!(store.cancel(&id));
        assert!(!store.cancel(&id));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_empty_books_are_removed() {
        let store = OrderStore::new();
        let sol = store.insert(stop("SOL", 90.0)).unwrap();
        let bonk = store.insert(stop("BONK", 0.001)).unwrap();
        assert_eq!(store.instrument_count(), 2);

        assert!(store.cancel(&sol));
        assert_eq!(store.instrument_count(), 1);
        assert!(store.book("SOL").is_none());

        store.insert(stop("SOL", 80.0)).unwrap();
        assert_eq!(store.instrument_count(), 2);

        assert!(store.cancel(&bonk));
        assert_eq!(store.instrument_count(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_update_condition() {
        let store = OrderStore::new();
        let id = store.insert(stop("SOL", 90.0)).unwrap();

        store.update_condition(&id, Condition::take_profit(150.0, None)).unwrap();
        assert_eq!(store.get(&id).unwrap().condition, Condition::take_profit(150.0, None));

        let missing = store.update_condition(&uuid::Uuid::new_v4(), Condition::stop_loss(1.0));
        assert!(matches!(missing, Err(OrderError::OrderNotFound(_))));

        let invalid = store.update_condition(&id, Condition::stop_loss(0.0));
        assert!(matches!(invalid, Err(OrderError::InvalidOrderParameter(_))));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = OrderStore::new();
        let id = store.insert(stop("SOL", 90.0)).unwrap();
        let snapshot = store.snapshot();
        store.cancel(&id);
        assert_eq!(snapshot.len(), 1);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_concurrent_cancel_removes_once() {
        let store = Arc::new(OrderStore::new());
        let id = store.insert(stop("SOL", 90.0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.cancel(&id))
            })
            .collect();

        let removed = handles.into_iter().map(|h| h.join().unwrap()).filter(|removed| *removed).count();
        assert_eq!(removed, 1);
    }
}

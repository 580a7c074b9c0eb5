//! Intrusive circular doubly linked list whose elements are identified by
//! indices into a link array.
//!
//! A list is a [`ListHead`] plus a slice of `Option<Link>` shared by every
//! list whose elements are drawn from the same index space. An element is
//! linked iff its slot is `Some(_)`, so an element can be a member of at most
//! one list per link array.
use core::fmt;

/// Circular linked list header.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct ListHead {
    pub first: Option<usize>,
}

impl fmt::Debug for ListHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl ListHead {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link {
    pub prev: usize,
    pub next: usize,
}

/// An error type indicating inconsistency in a linked list structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    AlreadyLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for InsertError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemError {
    NotLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for ItemError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

/// Accessor to a linked list.
#[derive(Debug)]
pub struct ListAccessor<'a> {
    head: &'a mut ListHead,
    links: &'a mut [Option<Link>],
}

impl<'a> ListAccessor<'a> {
    pub fn new(head: &'a mut ListHead, links: &'a mut [Option<Link>]) -> Self {
        Self { head, links }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Get a flag indicating whether `item` is linked to *some* list sharing
    /// this link array.
    pub fn is_linked(&self, item: usize) -> bool {
        matches!(self.links.get(item), Some(Some(_)))
    }

    #[inline]
    fn link(&self, item: usize) -> Result<Link, InconsistentError> {
        self.links
            .get(item)
            .copied()
            .flatten()
            .ok_or(InconsistentError)
    }

    #[inline]
    fn link_mut(&mut self, item: usize) -> Result<&mut Link, InconsistentError> {
        self.links
            .get_mut(item)
            .and_then(Option::as_mut)
            .ok_or(InconsistentError)
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head.first
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: usize, at: Option<usize>) -> Result<(), InsertError> {
        match self.links.get(item) {
            None => return Err(InconsistentError.into()),
            Some(Some(_)) => return Err(InsertError::AlreadyLinked),
            Some(None) => {}
        }

        if let Some(first) = self.head.first {
            let (next, update_first) = if let Some(at) = at {
                (at, at == first)
            } else {
                (first, false)
            };

            let prev = self.link(next)?.prev;
            self.link_mut(prev)?.next = item;
            self.link_mut(next)?.prev = item;
            self.links[item] = Some(Link { prev, next });

            if update_first {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());

            self.links[item] = Some(Link {
                prev: item,
                next: item,
            });
            self.head.first = Some(item);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: usize) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: usize) -> Result<(), InsertError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    ///
    /// `item` must be a member of this list, not of another list sharing the
    /// link array.
    pub fn remove(&mut self, item: usize) -> Result<usize, ItemError> {
        let link = match self.links.get(item) {
            None => return Err(InconsistentError.into()),
            Some(None) => return Err(ItemError::NotLinked),
            Some(Some(link)) => *link,
        };

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                self.links[item] = None;
                return Ok(item);
            }

            // Move the head pointer
            self.head.first = Some(link.next);
        }

        self.link_mut(link.prev)?.next = link.next;
        self.link_mut(link.next)?.prev = link.prev;
        self.links[item] = None;

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Result<Option<usize>, InconsistentError> {
        self.front()
            .map(|item| {
                // `ItemError::NotLinked` would be unexpected here, so convert
                // it to `InconsistentError`
                self.remove(item).map_err(|_| InconsistentError)
            })
            .transpose()
    }

    /// Get the next element of the specified element.
    #[inline]
    pub fn next(&self, i: usize) -> Result<Option<usize>, ItemError> {
        let next = self
            .links
            .get(i)
            .ok_or(InconsistentError)?
            .ok_or(ItemError::NotLinked)?
            .next;
        Ok(if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    fn items(accessor: &ListAccessor<'_>) -> Vec<usize> {
        let mut items = Vec::new();
        let mut cursor = accessor.front();
        while let Some(i) = cursor {
            items.push(i);
            cursor = accessor.next(i).unwrap();
        }
        items
    }

    #[test]
    fn basic() {
        let mut head = ListHead::new();
        let mut links = vec![None; 4];
        let mut accessor = ListAccessor::new(&mut head, &mut links);

        accessor.push_back(1).unwrap();
        accessor.push_back(2).unwrap();
        accessor.push_front(3).unwrap();

        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(3));
        assert_eq!(accessor.next(3).unwrap(), Some(1));
        assert_eq!(accessor.next(2).unwrap(), None);
        assert_eq!(items(&accessor), [3, 1, 2]);

        assert_eq!(accessor.push_back(1), Err(InsertError::AlreadyLinked));
        assert_eq!(accessor.remove(0), Err(ItemError::NotLinked));

        accessor.insert(0, Some(1)).unwrap();
        assert_eq!(items(&accessor), [3, 0, 1, 2]);

        accessor.remove(1).unwrap();
        accessor.remove(2).unwrap();
        accessor.remove(3).unwrap();
        accessor.remove(0).unwrap();

        assert!(accessor.is_empty());
        assert!(links.iter().all(Option::is_none));
    }

    #[test]
    fn clear() {
        let mut head = ListHead::new();
        let mut links = vec![None; 3];
        let mut accessor = ListAccessor::new(&mut head, &mut links);

        accessor.push_back(0).unwrap();
        accessor.push_back(1).unwrap();
        accessor.push_front(2).unwrap();

        let mut popped = Vec::new();
        while let Some(i) = accessor.pop_front().unwrap() {
            popped.push(i);
        }
        assert_eq!(popped, [2, 0, 1]);
        assert_eq!(head.first, None);
    }

    #[test]
    fn out_of_range_index_is_inconsistent() {
        let mut head = ListHead::new();
        let mut links = vec![None; 2];
        let mut accessor = ListAccessor::new(&mut head, &mut links);
        assert_eq!(
            accessor.push_back(5),
            Err(InsertError::Inconsistent(InconsistentError))
        );
        assert_eq!(
            accessor.remove(5),
            Err(ItemError::Inconsistent(InconsistentError))
        );
    }

    #[derive(Debug)]
    enum Cmd {
        PushBack(usize),
        PushFront(usize),
        PopFront,
        Remove(usize),
    }

    const POOL_LEN: usize = 16;

    /// Map random bytes to operations on a list over `POOL_LEN` elements.
    /// Whether an operation is valid is decided against the reference model.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        bytecode.chunks_exact(2).map(|instr| {
            let item = instr[1] as usize % POOL_LEN;
            match instr[0] % 4 {
                0 => Cmd::PushBack(item),
                1 => Cmd::PushFront(item),
                2 => Cmd::PopFront,
                _ => Cmd::Remove(item),
            }
        })
    }

    #[quickcheck]
    fn matches_vec_deque(bytecode: Vec<u8>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut head = ListHead::new();
        let mut links = vec![None; POOL_LEN];
        let mut reference = VecDeque::new();

        for cmd in interpret(&bytecode) {
            log::trace!("{cmd:?}");
            let mut accessor = ListAccessor::new(&mut head, &mut links);
            match cmd {
                Cmd::PushBack(i) => {
                    if reference.contains(&i) {
                        assert_eq!(accessor.push_back(i), Err(InsertError::AlreadyLinked));
                    } else {
                        accessor.push_back(i).unwrap();
                        reference.push_back(i);
                    }
                }
                Cmd::PushFront(i) => {
                    if reference.contains(&i) {
                        assert_eq!(accessor.push_front(i), Err(InsertError::AlreadyLinked));
                    } else {
                        accessor.push_front(i).unwrap();
                        reference.push_front(i);
                    }
                }
                Cmd::PopFront => {
                    assert_eq!(accessor.pop_front().unwrap(), reference.pop_front());
                }
                Cmd::Remove(i) => {
                    if let Some(pos) = reference.iter().position(|&x| x == i) {
                        reference.remove(pos);
                        accessor.remove(i).unwrap();
                    } else {
                        assert_eq!(accessor.remove(i), Err(ItemError::NotLinked));
                    }
                }
            }

            let accessor = ListAccessor::new(&mut head, &mut links);
            assert_eq!(items(&accessor), Vec::from(reference.clone()));
        }
    }
}

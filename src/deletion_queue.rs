use std::any::Any;

use log::trace;

/// Ordered list of GPU resources waiting to be released.
///
/// Resources are dropped in reverse registration order when the queue is flushed, so
/// anything registered after the resources it depends on is released before them.
pub struct DeletionQueue {
    name: &'static str,
    entries: Vec<(&'static str, Box<dyn Any>)>,
}

impl DeletionQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn push<T: 'static>(&mut self, label: &'static str, resource: T) {
        trace!("{} deletion queue: deferring {label}", self.name);
        self.entries.push((label, Box::new(resource)));
    }

    pub fn flush(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        trace!(
            "Flushing {} deletion queue ({} resources)",
            self.name,
            self.entries.len()
        );
        while let Some((label, resource)) = self.entries.pop() {
            trace!("{} deletion queue: releasing {label}", self.name);
            drop(resource);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    struct Recorded {
        id: u32,
        log: Rc<RefCell<Vec<u32>>>,
    }

    impl Drop for Recorded {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    fn recorded(id: u32, log: &Rc<RefCell<Vec<u32>>>) -> Recorded {
        Recorded {
            id,
            log: log.clone(),
        }
    }

    #[test]
    fn flush_releases_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::new("test");

        queue.push("buffer", recorded(1, &log));
        queue.push("structure", recorded(2, &log));
        queue.push("view", recorded(3, &log));
        assert_eq!(queue.len(), 3);

        queue.flush();

        assert_eq!(*log.borrow(), vec![3, 2, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn nothing_is_released_before_flush() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::new("test");

        queue.push("buffer", recorded(1, &log));

        assert!(log.borrow().is_empty());
        queue.flush();
        queue.flush();
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn dropping_the_queue_flushes_it() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut queue = DeletionQueue::new("test");
            queue.push("a", recorded(1, &log));
            queue.push("b", recorded(2, &log));
        }

        assert_eq!(*log.borrow(), vec![2, 1]);
    }
}

//! Link bookkeeping for the btleplug backend.
//!
//! A link is *pending* while its connect is in flight and *live* once the
//! connect succeeded. Only live links can be lost: a disconnect reported for
//! a peripheral whose newest link is still pending belongs to an older link.

use std::collections::HashMap;

use crate::ble::hardware::LinkId;

/// Which peripheral backs each link.
#[derive(Debug)]
pub(crate) struct LinkTable<I> {
    pending: HashMap<LinkId, I>,
    live: HashMap<LinkId, I>,
}

impl<I: Clone + PartialEq> LinkTable<I> {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
            live: HashMap::new(),
        }
    }

    /// A connect to `peripheral` was issued for `link`.
    pub(crate) fn begin(&mut self, link: LinkId, peripheral: I) {
        self.pending.insert(link, peripheral);
    }

    /// The connect for `link` succeeded.
    ///
    /// Returns `false` if the link was closed while connecting.
    pub(crate) fn establish(&mut self, link: LinkId) -> bool {
        match self.pending.remove(&link) {
            Some(peripheral) => {
                self.live.insert(link, peripheral);
                true
            }
            None => false,
        }
    }

    /// Forget `link`, pending or live.
    pub(crate) fn close(&mut self, link: LinkId) -> Option<I> {
        self.pending
            .remove(&link)
            .or_else(|| self.live.remove(&link))
    }

    /// Peripheral behind a live link.
    pub(crate) fn peripheral(&self, link: LinkId) -> Option<&I> {
        self.live.get(&link)
    }

    /// Live links on `peripheral`.
    pub(crate) fn live_on(&self, peripheral: &I) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self
            .live
            .iter()
            .filter(|(_, p)| *p == peripheral)
            .map(|(link, _)| *link)
            .collect();
        links.sort();
        links
    }
}

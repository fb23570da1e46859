use crate::dbglog;
use crate::error::{CommError, CommResult};
use crate::io_handler::{HandlerTag, IoHandler};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};

//====================================================================================
//            HandlerMap
//====================================================================================

struct MapState {
    data: HashMap<SocketAddr, Arc<IoHandler>>,
    datagram: HashMap<SocketAddr, Arc<IoHandler>>,
    accept: HashMap<SocketAddr, Arc<IoHandler>>,
    /// proxy name -> address the name currently resolves to.
    proxies: HashMap<String, SocketAddr>,
    /// decommissioned handlers awaiting purge by their reactor's cleanup pass.
    retired: Vec<Arc<IoHandler>>,
}

impl MapState {
    fn table_mut(&mut self, tag: HandlerTag) -> &mut HashMap<SocketAddr, Arc<IoHandler>> {
        match tag {
            HandlerTag::Data => &mut self.data,
            HandlerTag::Datagram => &mut self.datagram,
            HandlerTag::Accept => &mut self.accept,
        }
    }

    /// Drop every address (primary, alias) under which `handler` is registered.
    fn unlink(&mut self, handler: &Arc<IoHandler>) {
        let table = self.table_mut(handler.tag());
        table.retain(|_, h| !Arc::ptr_eq(h, handler));
    }
}

/// Address-keyed registry of all live handlers. Teardown is a two-phase protocol:
/// `decommission` makes a handler invisible to lookups and moves it to the retired
/// list; the owning reactor later confirms with `destroy_ok` and calls `purge`
/// once its own references are gone. Until purge, the `Arc` here keeps the
/// handler's socket open so no in-flight event can touch a closed descriptor.
pub(crate) struct HandlerMap {
    state: Mutex<MapState>,
    /// signalled whenever the retired list drains to empty.
    empty: Condvar,
}

impl HandlerMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MapState {
                data: HashMap::new(),
                datagram: HashMap::new(),
                accept: HashMap::new(),
                proxies: HashMap::new(),
                retired: Vec::new(),
            }),
            empty: Condvar::new(),
        })
    }

    //------------------------------ insert / lookup ------------------------------

    /// Register under the handler's primary address. Fails without side effects if
    /// that address already has a live handler of the same kind.
    pub(crate) fn insert(&self, handler: Arc<IoHandler>) -> CommResult<()> {
        let addr = match handler.tag() {
            HandlerTag::Data => handler.peer_addr(),
            _ => handler.local_addr(),
        };
        let mut st = self.state.lock().unwrap();
        let table = st.table_mut(handler.tag());
        if table.contains_key(&addr) {
            return Err(CommError::AlreadyConnected(addr));
        }
        table.insert(addr, handler);
        Ok(())
    }

    pub(crate) fn lookup_data(&self, addr: &SocketAddr) -> CommResult<Arc<IoHandler>> {
        let st = self.state.lock().unwrap();
        st.data
            .get(addr)
            .cloned()
            .ok_or(CommError::NotConnected(*addr))
    }

    pub(crate) fn lookup_datagram(&self, addr: &SocketAddr) -> CommResult<Arc<IoHandler>> {
        let st = self.state.lock().unwrap();
        st.datagram
            .get(addr)
            .cloned()
            .ok_or(CommError::NotConnected(*addr))
    }

    pub(crate) fn contains_data(&self, addr: &SocketAddr) -> bool {
        self.state.lock().unwrap().data.contains_key(addr)
    }

    /// Register `alias` as a second lookup key for the data handler at `addr`.
    pub(crate) fn set_alias(&self, addr: &SocketAddr, alias: SocketAddr) -> CommResult<()> {
        let mut st = self.state.lock().unwrap();
        let handler = st
            .data
            .get(addr)
            .cloned()
            .ok_or(CommError::NotConnected(*addr))?;
        st.data.insert(alias, handler);
        Ok(())
    }

    //------------------------------ proxies ------------------------------

    /// Bind a symbolic proxy name to the connection at `addr`. Re-binding an
    /// existing name simply moves it.
    pub(crate) fn add_proxy(&self, name: &str, addr: SocketAddr) -> CommResult<()> {
        let mut st = self.state.lock().unwrap();
        if !st.data.contains_key(&addr) {
            return Err(CommError::NotConnected(addr));
        }
        if let Some(handler) = st.data.get(&addr) {
            handler.set_proxy(name);
        }
        st.proxies.insert(name.to_owned(), addr);
        Ok(())
    }

    pub(crate) fn remove_proxy(&self, name: &str) {
        self.state.lock().unwrap().proxies.remove(name);
    }

    /// Resolve a proxy name to the address it maps to.
    pub(crate) fn translate_proxy(&self, name: &str) -> CommResult<SocketAddr> {
        let st = self.state.lock().unwrap();
        st.proxies
            .get(name)
            .copied()
            .ok_or_else(|| CommError::InvalidProxy(name.to_owned()))
    }

    //------------------------------ teardown protocol ------------------------------

    /// Phase one of teardown by address: hide the handler from all lookups and
    /// park it on the retired list. Returns the handler so the caller can shut it.
    pub(crate) fn decommission(&self, addr: &SocketAddr) -> CommResult<Arc<IoHandler>> {
        let mut st = self.state.lock().unwrap();
        let handler = st
            .data
            .get(addr)
            .or_else(|| st.datagram.get(addr))
            .or_else(|| st.accept.get(addr))
            .cloned()
            .ok_or(CommError::NotConnected(*addr))?;
        self.retire_locked(&mut st, &handler);
        Ok(handler)
    }

    /// Phase one of teardown by object, for handlers found dead by their reactor
    /// rather than closed by the application. Idempotent.
    pub(crate) fn decommission_object(&self, handler: &Arc<IoHandler>) {
        let mut st = self.state.lock().unwrap();
        self.retire_locked(&mut st, handler);
    }

    fn retire_locked(&self, st: &mut MapState, handler: &Arc<IoHandler>) {
        if handler.is_decommissioned() {
            return;
        }
        handler.mark_decommissioned();
        st.unlink(handler);
        if let Some(name) = handler.proxy() {
            st.proxies.remove(&name);
        }
        st.retired.push(Arc::clone(handler));
    }

    /// Decommission every live handler. Used by engine shutdown.
    pub(crate) fn decommission_all(&self) -> Vec<Arc<IoHandler>> {
        let mut st = self.state.lock().unwrap();
        let all: Vec<Arc<IoHandler>> = st
            .data
            .values()
            .chain(st.datagram.values())
            .chain(st.accept.values())
            .cloned()
            .collect();
        for handler in &all {
            self.retire_locked(&mut st, handler);
        }
        all
    }

    /// True once the handler has been decommissioned and parked; the reactor's
    /// cleanup pass may then release OS resources and purge.
    pub(crate) fn destroy_ok(&self, handler: &Arc<IoHandler>) -> bool {
        let st = self.state.lock().unwrap();
        handler.is_decommissioned() && st.retired.iter().any(|h| Arc::ptr_eq(h, handler))
    }

    /// Phase two: drop the registry's last reference. Signals waiters when the
    /// retired list drains.
    pub(crate) fn purge(&self, handler: &Arc<IoHandler>) {
        let mut st = self.state.lock().unwrap();
        let before = st.retired.len();
        st.retired.retain(|h| !Arc::ptr_eq(h, handler));
        if st.retired.len() == before {
            dbglog!("purge of {} found nothing retired", handler.peer_addr());
        }
        if st.retired.is_empty() {
            self.empty.notify_all();
        }
    }

    /// Block until every decommissioned handler has been purged by its reactor.
    pub(crate) fn wait_for_empty(&self) {
        let mut st = self.state.lock().unwrap();
        while !st.retired.is_empty() {
            st = self.empty.wait(st).unwrap();
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.data.is_empty() && st.datagram.is_empty() && st.accept.is_empty() && st.retired.is_empty()
    }
}

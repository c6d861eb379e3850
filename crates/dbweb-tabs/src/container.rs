//! TabsContainer: ordered registry of contributed tabs and menu entries.
//!
//! Contributors register a [`ContainerItem`] once; consumers query the
//! container per render with their current props. An item may be hidden for
//! some props, and may expand into several runtime tab ids through a
//! generator (one tab per open document, for instance).

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use dbweb_core::SyncExecutor;

use crate::error::ContainerError;
use crate::metadata::MetadataMap;

/// Order of items registered without one; they sort after everything else.
pub const DEFAULT_ORDER: u32 = u32::MAX;

pub type Generator<P> = Box<dyn Fn(&str, &P) -> Vec<String> + Send + Sync>;
pub type HiddenPredicate<P> = Box<dyn Fn(&str, &P) -> bool + Send + Sync>;
pub type StateGetter<P> = Box<dyn Fn(&P) -> Value + Send + Sync>;
pub type OpenHook<P> = Box<dyn Fn(&TabOpenEvent<'_, P>) + Send + Sync>;

/// Passed to an item's open hook when one of its tabs is selected.
#[derive(Debug)]
pub struct TabOpenEvent<'a, P> {
    pub tab_id: &'a str,
    pub props: &'a P,
}

// ─── Item ─────────────────────────────────────────────────────────

pub struct ContainerItem<P, O = ()> {
    key: String,
    order: u32,
    title: Option<String>,
    options: Option<O>,
    generator: Option<Generator<P>>,
    is_hidden: Option<HiddenPredicate<P>>,
    state_getter: Option<StateGetter<P>>,
    on_open: Option<OpenHook<P>>,
}

impl<P, O> ContainerItem<P, O> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            order: DEFAULT_ORDER,
            title: None,
            options: None,
            generator: None,
            is_hidden: None,
            state_getter: None,
            on_open: None,
        }
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_options(mut self, options: O) -> Self {
        self.options = Some(options);
        self
    }

    /// Expand this item into runtime tab ids.
    pub fn with_generator(
        mut self,
        generator: impl Fn(&str, &P) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    pub fn hidden_when(mut self, predicate: impl Fn(&str, &P) -> bool + Send + Sync + 'static) -> Self {
        self.is_hidden = Some(Box::new(predicate));
        self
    }

    /// Initial state for tabs of this item, used by
    /// [`TabsContainer::get_tab_state`].
    pub fn with_state(mut self, getter: impl Fn(&P) -> Value + Send + Sync + 'static) -> Self {
        self.state_getter = Some(Box::new(getter));
        self
    }

    pub fn on_open(mut self, hook: impl Fn(&TabOpenEvent<'_, P>) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Box::new(hook));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn options(&self) -> Option<&O> {
        self.options.as_ref()
    }

    pub fn is_generated(&self) -> bool {
        self.generator.is_some()
    }

    pub fn is_hidden(&self, props: &P) -> bool {
        self.is_hidden
            .as_ref()
            .is_some_and(|hidden| hidden(&self.key, props))
    }

    /// Tab ids this item stands for: its generator's output, or its key.
    pub fn expand(&self, props: &P) -> Vec<String> {
        match &self.generator {
            Some(generator) => generator(&self.key, props),
            None => vec![self.key.clone()],
        }
    }

    fn default_state(&self, props: &P) -> Option<Value> {
        self.state_getter.as_ref().map(|getter| getter(props))
    }
}

impl<P, O: fmt::Debug> fmt::Debug for ContainerItem<P, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerItem")
            .field("key", &self.key)
            .field("order", &self.order)
            .field("title", &self.title)
            .field("options", &self.options)
            .field("generated", &self.generator.is_some())
            .finish_non_exhaustive()
    }
}

// ─── Container ────────────────────────────────────────────────────

pub struct TabsContainer<P, O = ()> {
    area_label: String,
    items: Vec<ContainerItem<P, O>>,
    keys: HashSet<String>,
    selected: Option<String>,
    on_select: SyncExecutor<Option<String>>,
}

impl<P, O> TabsContainer<P, O> {
    pub fn new(area_label: impl Into<String>) -> Self {
        Self {
            area_label: area_label.into(),
            items: Vec::new(),
            keys: HashSet::new(),
            selected: None,
            on_select: SyncExecutor::new(),
        }
    }

    pub fn area_label(&self) -> &str {
        &self.area_label
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Fired with the new selection whenever it is recorded.
    pub fn on_select(&self) -> &SyncExecutor<Option<String>> {
        &self.on_select
    }

    pub fn add(&mut self, item: ContainerItem<P, O>) -> Result<(), ContainerError> {
        if !self.keys.insert(item.key.clone()) {
            return Err(ContainerError::DuplicateKey(item.key));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn get_tab_info(&self, key: &str) -> Option<&ContainerItem<P, O>> {
        self.items.iter().find(|item| item.key == key)
    }

    /// Items applicable to `props`, ordered by `order` with ties kept in
    /// registration order.
    pub fn get_displayed(&self, props: &P) -> Vec<&ContainerItem<P, O>> {
        let mut displayed: Vec<_> = self
            .items
            .iter()
            .filter(|item| !item.is_hidden(props))
            .collect();
        displayed.sort_by_key(|item| item.order);
        displayed
    }

    /// Item responsible for `tab_id`: a registered key, else the first
    /// displayed item whose expansion contains it.
    pub fn get_displayed_tab_info(&self, tab_id: &str, props: &P) -> Option<&ContainerItem<P, O>> {
        if let Some(item) = self.get_tab_info(tab_id) {
            return Some(item);
        }
        self.get_displayed(props)
            .into_iter()
            .find(|item| item.is_generated() && item.expand(props).iter().any(|id| id == tab_id))
    }

    /// Every concrete tab id currently displayed, in display order.
    pub fn get_id_list(&self, props: &P) -> Vec<String> {
        self.get_displayed(props)
            .into_iter()
            .flat_map(|item| item.expand(props))
            .collect()
    }

    /// Select `tab_id`, or clear the selection with `None`.
    ///
    /// The owning item's open hook runs before the selection is recorded.
    /// Ids no item resolves are ignored.
    pub fn select(&mut self, tab_id: Option<&str>, props: &P) {
        let Some(tab_id) = tab_id else {
            self.selected = None;
            self.on_select.execute(&None);
            return;
        };

        let Some(item) = self.get_displayed_tab_info(tab_id, props) else {
            trace!(area = %self.area_label, tab_id, "ignoring selection of unknown tab");
            return;
        };
        if let Some(hook) = &item.on_open {
            hook(&TabOpenEvent { tab_id, props });
        }

        self.selected = Some(tab_id.to_owned());
        self.on_select.execute(&self.selected);
    }

    /// State slice for `tab_id` in `store`, created on first access.
    ///
    /// The default comes from the owning item's state getter, else
    /// `T::default()`. A stored value that does not fit `T` is replaced by
    /// that default.
    pub fn get_tab_state<T>(
        &self,
        store: &mut MetadataMap,
        tab_id: &str,
        props: &P,
    ) -> Result<T, ContainerError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let item = self.get_displayed_tab_info(tab_id, props);
        store.get_or_insert_with(tab_id, || {
            match item.and_then(|item| item.default_state(props)) {
                Some(value) => Ok(serde_json::from_value(value)?),
                None => Ok(T::default()),
            }
        })
    }

    /// [`get_tab_state`](Self::get_tab_state) with an explicit default that
    /// takes precedence over the item's state getter.
    pub fn get_tab_state_or<T>(
        &self,
        store: &mut MetadataMap,
        tab_id: &str,
        default: impl FnOnce() -> T,
    ) -> Result<T, ContainerError>
    where
        T: Serialize + DeserializeOwned,
    {
        store.get_or_insert_with(tab_id, || Ok(default()))
    }
}

impl<P, O: fmt::Debug> fmt::Debug for TabsContainer<P, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabsContainer")
            .field("area_label", &self.area_label)
            .field("items", &self.items)
            .field("selected", &self.selected)
            .finish()
    }
}

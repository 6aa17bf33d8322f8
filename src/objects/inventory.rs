//! Ordered object collections owned by a user or a room.

use std::fmt;

use super::{Object, ObjectClass};
use crate::chat::protocol::ItemInfo;

/// Most objects of one class an inventory may hold.
pub const MAX_PER_CLASS: usize = 5;

#[derive(Debug, Default, Clone)]
pub struct Inventory {
    objects: Vec<Object>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `object`, handing it back when the inventory already holds it or is
    /// full for its class.
    pub fn add(&mut self, object: Object) -> Result<(), Object> {
        if self.objects.contains(&object) || self.count_class(object.class()) >= MAX_PER_CLASS {
            return Err(object);
        }
        self.objects.push(object);
        Ok(())
    }

    /// Put back an object taken out with [`Inventory::remove`], at its old position.
    pub fn restore(&mut self, index: usize, object: Object) {
        let index = index.min(self.objects.len());
        self.objects.insert(index, object);
    }

    pub fn remove(&mut self, index: usize) -> Option<Object> {
        (index < self.objects.len()).then(|| self.objects.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&Object> {
        self.objects.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Object> {
        self.objects.get_mut(index)
    }

    pub fn count_class(&self, class: ObjectClass) -> usize {
        self.objects.iter().filter(|o| o.class() == class).count()
    }

    /// Positions of every object of `class`.
    pub fn search_by_class(&self, class: ObjectClass) -> Vec<usize> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.class() == class)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.objects.iter_mut()
    }

    pub fn drain(&mut self) -> Vec<Object> {
        std::mem::take(&mut self.objects)
    }

    pub fn listing(&self) -> Vec<ItemInfo> {
        self.objects
            .iter()
            .enumerate()
            .map(|(id, o)| ItemInfo {
                id,
                name: o.name(),
                icon: o.descriptor().icon,
            })
            .collect()
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.objects.is_empty() {
            return f.write_str("empty");
        }
        for (i, o) in self.objects.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} : {}", i, o.name())?;
        }
        Ok(())
    }
}

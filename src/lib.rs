use std::{alloc::Layout, any::TypeId, ffi::c_void, pin::Pin, ptr::NonNull};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    list::List,
    pool::{FixedPool, PoolBox},
    sprite::{Sprite, SpriteBatch},
};

pub mod list;
pub mod palette;
pub mod pool;
pub mod prelude;
pub mod rc;
pub mod sprite;


#[derive(Debug, Clone, thiserror::Error)]
pub enum GroupError {
    #[error("Group is full and can not take more entities")]
    OutOfCapacity,
    #[error("Entity kind was not registered with this group")]
    UnknownKind,
}

pub type GroupResult<T> = Result<T, GroupError>;

/// Context handed to every entity update within one frame.
#[derive(Clone, Copy, Debug)]
pub struct Tick {
    /// Frame delta in milliseconds
    pub dt: u32,
}

/// Contract for types living in an [`EntityGroup`].
///
/// `update` runs once per frame for every live entity; an entity reporting
/// `dead` afterwards is unlinked and destroyed in the same sweep.
/// Renderable kinds expose their sprite so the render pass can project
/// them into a [`SpriteBatch`].
pub trait Entity: 'static {
    fn update(&mut self, tick: &Tick);

    fn dead(&self) -> bool {
        false
    }

    fn sprite(&self) -> Option<&Sprite> {
        None
    }
}

/// Fixed, heterogeneous set of per-kind member lists.
///
/// All kinds share one payload pool (cells sized to the largest registered
/// kind) and one node pool, both owned by the group, so the total live
/// entity count across every member list never exceeds the capacity the
/// group was built with. Kinds are fixed at [`GroupConfig::build`] time;
/// the per-kind operations are instantiated there and dispatched through
/// plain fn pointers, so no frame-path operation allocates.
pub struct EntityGroup {
    // kinds must drop before the pools they post their cells back into
    kinds: SmallVec<[ErasedKindList; 8]>,
    by_ty: FxHashMap<TypeId, usize>,
    node_pool: Pin<Box<FixedPool>>,
    payload_pool: Pin<Box<FixedPool>>,
}

impl EntityGroup {
    /// Move `entity` into the group and link it into its kind's list.
    ///
    /// On failure nothing is mutated: the payload cell (if one was taken)
    /// is reclaimed before returning. Exhaustion is the only runtime
    /// failure mode besides spawning a kind the group was not built with.
    pub fn spawn<T: Entity>(&mut self, entity: T) -> GroupResult<()> {
        let index = *self
            .by_ty
            .get(&TypeId::of::<T>())
            .ok_or(GroupError::UnknownKind)?;
        debug_assert_eq!(self.kinds[index].ty, TypeId::of::<T>());
        let payload_ptr = NonNull::from(self.payload_pool.as_mut().get_mut());
        let boxed =
            unsafe { PoolBox::new_in(payload_ptr, entity) }.ok_or(GroupError::OutOfCapacity)?;
        let list = unsafe { self.kinds[index].as_inner_mut::<T>() };
        // a failed push drops the box, which rolls the payload cell back
        list.push(boxed).map_err(|_| GroupError::OutOfCapacity)?;
        #[cfg(feature = "tracing")]
        tracing::trace!(kind = self.kinds[index].ty_name, "Spawned entity");
        Ok(())
    }

    /// The member list holding every live `T`, for direct iteration and
    /// cursor-based removal by outside passes (collision, scripted kills).
    pub fn kind<T: Entity>(&self) -> Option<&List<PoolBox<T>>> {
        let index = *self.by_ty.get(&TypeId::of::<T>())?;
        debug_assert_eq!(self.kinds[index].ty, TypeId::of::<T>());
        Some(unsafe { self.kinds[index].as_inner::<T>() })
    }

    pub fn kind_mut<T: Entity>(&mut self) -> Option<&mut List<PoolBox<T>>> {
        let index = *self.by_ty.get(&TypeId::of::<T>())?;
        debug_assert_eq!(self.kinds[index].ty, TypeId::of::<T>());
        Some(unsafe { self.kinds[index].as_inner_mut::<T>() })
    }

    /// The uniform update pass: every member list in declaration order,
    /// newest-first within one kind. Entities reporting dead are destroyed
    /// in the same traversal; their cells are immediately reusable.
    pub fn update_all(&mut self, tick: &Tick) {
        for kind in self.kinds.iter_mut() {
            (kind.update_all)(kind, tick);
        }
    }

    /// The uniform render pass: project every live entity's sprite into
    /// `batch`. Depth ordering is the batch's business, not the group's.
    pub fn render_into<'a>(&'a self, batch: &mut SpriteBatch<'a>) {
        for kind in self.kinds.iter() {
            (kind.collect)(kind, batch);
        }
    }

    /// Destroy every entity in every member list (level transition).
    pub fn clear(&mut self) {
        for kind in self.kinds.iter_mut() {
            (kind.clear)(kind);
        }
        #[cfg(feature = "tracing")]
        tracing::trace!("Cleared entity group");
    }

    /// Live entities across all member lists.
    pub fn len(&self) -> usize {
        self.payload_pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.payload_pool.capacity()
    }

    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }
}

impl std::fmt::Debug for EntityGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGroup")
            .field("capacity", &self.capacity())
            .field("live", &self.len())
            .field("nodes", &self.node_pool.len())
            .field(
                "kinds",
                &self
                    .kinds
                    .iter()
                    .map(|k| (k.ty_name, (k.len)(k)))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Declaration of an [`EntityGroup`]: which kinds it will hold.
///
/// Capacities are passed in by the owner instead of living in hidden
/// statics, so a test can build the same group two sizes smaller.
pub struct GroupConfig {
    kinds: Vec<KindDecl>,
}

struct KindDecl {
    ty: TypeId,
    ty_name: &'static str,
    payload: Layout,
    node: Layout,
    make: fn(NonNull<FixedPool>) -> ErasedKindList,
}

impl GroupConfig {
    pub fn new() -> Self {
        Self { kinds: Vec::new() }
    }

    pub fn register<T: Entity>(mut self) -> Self {
        debug_assert!(
            !self.kinds.iter().any(|k| k.ty == TypeId::of::<T>()),
            "kind registered twice"
        );
        self.kinds.push(KindDecl {
            ty: TypeId::of::<T>(),
            ty_name: std::any::type_name::<T>(),
            payload: Layout::new::<T>(),
            node: List::<PoolBox<T>>::node_layout(),
            make: ErasedKindList::new::<T>,
        });
        self
    }

    /// Allocate the shared pools and instantiate one member list per
    /// registered kind. `capacity` bounds live entities over the whole
    /// group, not per kind.
    pub fn build(self, capacity: u32) -> EntityGroup {
        assert!(!self.kinds.is_empty(), "group declared with no kinds");
        let payload = self
            .kinds
            .iter()
            .map(|k| k.payload)
            .reduce(max_layout)
            .unwrap();
        let node = self.kinds.iter().map(|k| k.node).reduce(max_layout).unwrap();

        let mut node_pool = Box::pin(FixedPool::new(node, capacity));
        let payload_pool = Box::pin(FixedPool::new(payload, capacity));
        let node_ptr = NonNull::from(node_pool.as_mut().get_mut());

        let mut kinds = SmallVec::new();
        let mut by_ty = FxHashMap::default();
        for (index, decl) in self.kinds.iter().enumerate() {
            by_ty.insert(decl.ty, index);
            kinds.push((decl.make)(node_ptr));
        }
        EntityGroup {
            kinds,
            by_ty,
            node_pool,
            payload_pool,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn max_layout(a: Layout, b: Layout) -> Layout {
    Layout::from_size_align(a.size().max(b.size()), a.align().max(b.align()))
        .expect("layout overflow")
}

/// Type erased member list
struct ErasedKindList {
    ty: TypeId,
    ty_name: &'static str,
    /// Box<List<PoolBox<T>>>
    inner: *mut c_void,
    finalize: fn(&mut ErasedKindList),
    clear: fn(&mut ErasedKindList),
    len: fn(&ErasedKindList) -> usize,
    update_all: fn(&mut ErasedKindList, &Tick),
    collect: for<'a> fn(&'a ErasedKindList, &mut SpriteBatch<'a>),
}

impl Drop for ErasedKindList {
    fn drop(&mut self) {
        (self.finalize)(self);
    }
}

impl ErasedKindList {
    fn new<T: Entity>(node_pool: NonNull<FixedPool>) -> Self {
        let list: List<PoolBox<T>> = unsafe { List::new(node_pool) };
        Self {
            ty: TypeId::of::<T>(),
            ty_name: std::any::type_name::<T>(),
            inner: Box::into_raw(Box::new(list)).cast(),
            finalize: |erased| unsafe {
                drop(Box::from_raw(erased.inner.cast::<List<PoolBox<T>>>()));
            },
            clear: |erased| unsafe { erased.as_inner_mut::<T>() }.clear(),
            len: |erased| unsafe { erased.as_inner::<T>() }.len(),
            update_all: update_kind::<T>,
            collect: collect_kind::<T>,
        }
    }

    /// # SAFETY
    /// Must be called with the same type as `new`
    unsafe fn as_inner<T: Entity>(&self) -> &List<PoolBox<T>> {
        &*self.inner.cast()
    }

    /// # SAFETY
    /// Must be called with the same type as `new`
    unsafe fn as_inner_mut<T: Entity>(&mut self) -> &mut List<PoolBox<T>> {
        &mut *self.inner.cast()
    }
}

fn update_kind<T: Entity>(erased: &mut ErasedKindList, tick: &Tick) {
    let list = unsafe { erased.as_inner_mut::<T>() };
    list.retain(|entity| {
        entity.update(tick);
        !entity.dead()
    });
}

fn collect_kind<'a, T: Entity>(erased: &'a ErasedKindList, batch: &mut SpriteBatch<'a>) {
    let list = unsafe { erased.as_inner::<T>() };
    for entity in list.iter() {
        if let Some(sprite) = entity.sprite() {
            batch.push(sprite);
        }
    }
}

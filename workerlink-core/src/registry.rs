use dashmap::DashMap;
use std::any::TypeId;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::transfer::TypeTag;

#[derive(Debug, Clone, PartialEq)]
pub struct CallableMeta {
    pub name: String,
    pub shallow_transfer_return: Option<TypeTag>,
    pub return_is_async: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessibleMeta {
    pub name: String,
    pub allow_get: bool,
    pub allow_set: bool,
    pub shallow_transfer: Option<TypeTag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamableMeta {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShallowTransferArgMeta {
    pub member: String,
    pub arg_index: usize,
    pub tag: TypeTag,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Remotable,
    Callable(CallableMeta),
    Accessible(AccessibleMeta),
    Streamable(StreamableMeta),
    ShallowTransferArg(ShallowTransferArgMeta),
}

impl Annotation {
    pub fn category(&self) -> Category {
        match self {
            Annotation::Remotable => Category::Remotable,
            Annotation::Callable(_) => Category::Callable,
            Annotation::Accessible(_) => Category::Accessible,
            Annotation::Streamable(_) => Category::Streamable,
            Annotation::ShallowTransferArg(_) => Category::ShallowTransferArg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Remotable,
    Callable,
    Accessible,
    Streamable,
    ShallowTransferArg,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Remotable => "remotable",
            Category::Callable => "callable",
            Category::Accessible => "accessible",
            Category::Streamable => "streamable",
            Category::ShallowTransferArg => "shallow transfer argument",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("member \"{member}\" of {owner} is already registered as {existing}")]
    Duplicate {
        owner: String,
        member: String,
        existing: Category,
    },
    #[error("argument {index} of \"{member}\" on {owner} already has a transfer type")]
    DuplicateArgument {
        owner: String,
        member: String,
        index: usize,
    },
    #[error("declaration cached for {owner} belongs to another type")]
    Mismatch { owner: String },
}

impl From<RegistryError> for crate::RpcError {
    fn from(err: RegistryError) -> Self {
        crate::RpcError::internal(err.to_string())
    }
}

/// Everything registered for one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeAnnotations {
    pub type_name: String,
    pub is_remotable: bool,
    pub callables: Vec<CallableMeta>,
    pub accessibles: Vec<AccessibleMeta>,
    pub streamables: Vec<StreamableMeta>,
    pub shallow_transfer_args: Vec<ShallowTransferArgMeta>,
}

impl TypeAnnotations {
    fn member_category(&self, name: &str) -> Option<Category> {
        if self.callables.iter().any(|m| m.name == name) {
            Some(Category::Callable)
        } else if self.accessibles.iter().any(|m| m.name == name) {
            Some(Category::Accessible)
        } else if self.streamables.iter().any(|m| m.name == name) {
            Some(Category::Streamable)
        } else {
            None
        }
    }

    fn list(&self, category: Category) -> Vec<Annotation> {
        match category {
            Category::Remotable => {
                if self.is_remotable {
                    vec![Annotation::Remotable]
                } else {
                    Vec::new()
                }
            }
            Category::Callable => self.callables.iter().cloned().map(Annotation::Callable).collect(),
            Category::Accessible => self
                .accessibles
                .iter()
                .cloned()
                .map(Annotation::Accessible)
                .collect(),
            Category::Streamable => self
                .streamables
                .iter()
                .cloned()
                .map(Annotation::Streamable)
                .collect(),
            Category::ShallowTransferArg => self
                .shallow_transfer_args
                .iter()
                .cloned()
                .map(Annotation::ShallowTransferArg)
                .collect(),
        }
    }
}

static GLOBAL: LazyLock<AnnotationRegistry> = LazyLock::new(AnnotationRegistry::new);

/// Which members of each remote type may be reached across the bus, and how.
///
/// Registration is additive and permanent for the process. Several
/// declaration sites may register against the same type.
#[derive(Debug)]
pub struct AnnotationRegistry {
    types: DashMap<TypeId, TypeAnnotations>,
}

impl AnnotationRegistry {
    pub fn new() -> Self {
        AnnotationRegistry {
            types: DashMap::new(),
        }
    }

    /// The process-wide registry that `Declaration`s write to.
    pub fn global() -> &'static AnnotationRegistry {
        &GLOBAL
    }

    /// Appends `annotation` to the list kept for `owner`, creating it on first use.
    pub fn register(
        &self,
        owner: TypeId,
        owner_name: &str,
        annotation: Annotation,
    ) -> Result<(), RegistryError> {
        let mut entry = self.types.entry(owner).or_insert_with(|| TypeAnnotations {
            type_name: owner_name.to_string(),
            ..TypeAnnotations::default()
        });
        let annotations = entry.value_mut();

        let member = match &annotation {
            Annotation::Callable(meta) => Some(meta.name.as_str()),
            Annotation::Accessible(meta) => Some(meta.name.as_str()),
            Annotation::Streamable(meta) => Some(meta.name.as_str()),
            _ => None,
        };
        if let Some(member) = member {
            if let Some(existing) = annotations.member_category(member) {
                return Err(RegistryError::Duplicate {
                    owner: owner_name.to_string(),
                    member: member.to_string(),
                    existing,
                });
            }
        }

        trace!(owner = owner_name, category = %annotation.category(), "registering annotation");
        match annotation {
            Annotation::Remotable => annotations.is_remotable = true,
            Annotation::Callable(meta) => annotations.callables.push(meta),
            Annotation::Accessible(meta) => annotations.accessibles.push(meta),
            Annotation::Streamable(meta) => annotations.streamables.push(meta),
            Annotation::ShallowTransferArg(meta) => {
                let taken = annotations
                    .shallow_transfer_args
                    .iter()
                    .any(|m| m.member == meta.member && m.arg_index == meta.arg_index);
                if taken {
                    return Err(RegistryError::DuplicateArgument {
                        owner: owner_name.to_string(),
                        member: meta.member,
                        index: meta.arg_index,
                    });
                }
                annotations.shallow_transfer_args.push(meta);
            }
        }
        Ok(())
    }

    /// The registered list for `category`, or `None` if the type is unknown.
    pub fn lookup(&self, owner: TypeId, category: Category) -> Option<Vec<Annotation>> {
        self.types.get(&owner).map(|entry| entry.list(category))
    }

    pub fn lookup_or(&self, owner: TypeId, category: Category, default: Vec<Annotation>) -> Vec<Annotation> {
        self.lookup(owner, category).unwrap_or(default)
    }

    pub fn annotations(&self, owner: TypeId) -> Option<TypeAnnotations> {
        self.types.get(&owner).map(|entry| entry.clone())
    }

    pub fn is_remotable(&self, owner: TypeId) -> bool {
        self.types.get(&owner).is_some_and(|entry| entry.is_remotable)
    }

    pub fn callable(&self, owner: TypeId, name: &str) -> Option<CallableMeta> {
        let entry = self.types.get(&owner)?;
        entry.callables.iter().find(|m| m.name == name).cloned()
    }

    pub fn accessible(&self, owner: TypeId, name: &str) -> Option<AccessibleMeta> {
        let entry = self.types.get(&owner)?;
        entry.accessibles.iter().find(|m| m.name == name).cloned()
    }

    pub fn streamable(&self, owner: TypeId, name: &str) -> Option<StreamableMeta> {
        let entry = self.types.get(&owner)?;
        entry.streamables.iter().find(|m| m.name == name).cloned()
    }

    /// Transfer tags for the arguments of `member`, in registration order.
    pub fn shallow_transfer_args(&self, owner: TypeId, member: &str) -> Vec<ShallowTransferArgMeta> {
        match self.types.get(&owner) {
            Some(entry) => entry
                .shallow_transfer_args
                .iter()
                .filter(|m| m.member == member)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for AnnotationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn log_declared(owner_name: &str, annotations: &TypeAnnotations) {
    debug!(
        owner = owner_name,
        callables = annotations.callables.len(),
        accessibles = annotations.accessibles.len(),
        streamables = annotations.streamables.len(),
        "remote type declared"
    );
}

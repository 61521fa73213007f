// Copyright 2020 Joyent, Inc.

//! Per-connection type OID registry
//!
//! Every connection handle carries an [`OidMap`](struct.OidMap.html) that maps
//! database type identifiers (OIDs) to descriptors used to decode values of
//! that type. Built-in types have OIDs fixed by the server. Custom types (for
//! example composite types or enums created by an application) get their OIDs
//! assigned when they are created, so they must be looked up in the type
//! catalog of the live connection. This happens exactly once, while the handle
//! is being constructed; the resulting map is frozen behind an `Arc` and never
//! mutated afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::{Display, From, Into};
use serde_derive::Deserialize;

use crate::connection::Connection;
use crate::error::Error;

/// A database type object identifier.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct Oid(u32);

/// The encoded size of a value of some type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TypeSize {
    /// Every value occupies exactly this many bytes.
    Fixed(usize),
    /// The size is carried with each value.
    Dynamic,
}

/// Decoder descriptor for a single type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeDescriptor {
    pub name: String,
    pub oid: Oid,
    pub size: TypeSize,
    pub builtin: bool,
}

/// A custom type to be resolved against the type catalog of each new
/// connection.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CustomType {
    pub name: String,
    /// Fixed encoded size in bytes; omitted for variable sized types.
    #[serde(default)]
    pub size: Option<usize>,
}

const BUILTIN_TYPES: &[(&str, u32, Option<usize>)] = &[
    ("bool", 16, Some(1)),
    ("bytea", 17, None),
    ("int8", 20, Some(8)),
    ("int2", 21, Some(2)),
    ("int4", 23, Some(4)),
    ("text", 25, None),
    ("oid", 26, Some(4)),
    ("json", 114, None),
    ("float4", 700, Some(4)),
    ("float8", 701, Some(8)),
    ("_int2", 1005, None),
    ("_int4", 1007, None),
    ("_text", 1009, None),
    ("_int8", 1016, None),
    ("_float4", 1021, None),
    ("_float8", 1022, None),
    ("varchar", 1043, None),
    ("date", 1082, Some(4)),
    ("timestamp", 1114, Some(8)),
    ("timestamptz", 1184, Some(8)),
    ("numeric", 1700, None),
    ("uuid", 2950, Some(16)),
    ("jsonb", 3802, None),
];

fn type_size(size: Option<usize>) -> TypeSize {
    size.map(TypeSize::Fixed).unwrap_or(TypeSize::Dynamic)
}

/// An immutable mapping from type OID to decoder descriptor.
#[derive(Clone, Debug, Default)]
pub struct OidMap {
    by_oid: HashMap<Oid, TypeDescriptor>,
    by_name: HashMap<String, Oid>,
}

impl OidMap {
    /// A map holding only the built-in types.
    pub fn builtin() -> Self {
        let mut map = OidMap::default();
        BUILTIN_TYPES.iter().for_each(|(name, oid, size)| {
            map.insert(TypeDescriptor {
                name: (*name).to_string(),
                oid: Oid::from(*oid),
                size: type_size(*size),
                builtin: true,
            })
        });
        map
    }

    fn insert(&mut self, descriptor: TypeDescriptor) {
        self.by_name.insert(descriptor.name.clone(), descriptor.oid);
        self.by_oid.insert(descriptor.oid, descriptor);
    }

    pub fn get(&self, oid: Oid) -> Option<&TypeDescriptor> {
        self.by_oid.get(&oid)
    }

    pub fn oid_of(&self, name: &str) -> Option<Oid> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.by_oid.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.by_oid.values()
    }
}

/// Accumulates custom type registrations before an `OidMap` is frozen.
#[derive(Clone, Debug)]
pub struct OidMapBuilder {
    map: OidMap,
    unresolved: Vec<(String, TypeSize)>,
}

impl OidMapBuilder {
    pub fn new() -> Self {
        OidMapBuilder {
            map: OidMap::builtin(),
            unresolved: Vec::new(),
        }
    }

    pub fn from_custom_types(types: &[CustomType]) -> Self {
        let mut builder = OidMapBuilder::new();
        types.iter().for_each(|t| {
            builder.register_type(t.name.clone(), type_size(t.size));
        });
        builder
    }

    /// Register a custom type whose OID is not yet known. Registering a name
    /// that is already present has no effect.
    pub fn register_type<S: Into<String>>(
        &mut self,
        name: S,
        size: TypeSize,
    ) -> &mut Self {
        let name = name.into();
        let known = self.map.by_name.contains_key(&name)
            || self.unresolved.iter().any(|(n, _)| *n == name);
        if !known {
            self.unresolved.push((name, size));
        }
        self
    }

    /// Assign the OID of a registered custom type without consulting a
    /// connection. Unregistered names are ignored. An OID already held by
    /// another type is rejected and the type stays unresolved.
    pub fn set_type_oid(
        &mut self,
        name: &str,
        oid: Oid,
    ) -> Result<&mut Self, Error> {
        let pos = match self.unresolved.iter().position(|(n, _)| n == name) {
            Some(pos) => pos,
            None => return Ok(self),
        };
        if let Some(existing) = self.map.get(oid) {
            return Err(Error::TypeOidConflict {
                name: name.to_string(),
                oid: oid.into(),
                existing: existing.name.clone(),
            });
        }

        let (name, size) = self.unresolved.remove(pos);
        self.map.insert(TypeDescriptor {
            name,
            oid,
            size,
            builtin: false,
        });
        Ok(self)
    }

    /// Names of registered custom types that still lack an OID.
    pub fn unresolved(&self) -> Vec<String> {
        self.unresolved.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Resolve any outstanding custom types from the type catalog of `conn`
    /// and freeze the map.
    pub fn populate<C>(mut self, conn: &mut C) -> Result<Arc<OidMap>, Error>
    where
        C: Connection,
    {
        if !self.unresolved.is_empty() {
            let names = self.unresolved();
            let catalog = conn
                .type_catalog(&names)
                .map_err(|e| Error::Driver(e.to_string()))?;
            for (name, oid) in catalog {
                self.set_type_oid(&name, oid)?;
            }
        }
        self.build()
    }

    /// Freeze the map. Fails if any custom type is still unresolved.
    pub fn build(self) -> Result<Arc<OidMap>, Error> {
        match self.unresolved.first() {
            Some((name, _)) => Err(Error::UnresolvedType(name.clone())),
            None => Ok(Arc::new(self.map)),
        }
    }
}

impl Default for OidMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::{Error as IOError, ErrorKind};

    struct CatalogConnection {
        catalog: Vec<(String, Oid)>,
        fail: bool,
    }

    impl Connection for CatalogConnection {
        type Error = IOError;
        type Socket = ();

        fn connect(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn socket(&self) -> Option<&()> {
            None
        }

        fn type_catalog(
            &mut self,
            names: &[String],
        ) -> Result<Vec<(String, Oid)>, Self::Error> {
            if self.fail {
                return Err(IOError::new(ErrorKind::Other, "catalog gone"));
            }
            Ok(self
                .catalog
                .iter()
                .filter(|(name, _)| names.contains(name))
                .cloned()
                .collect())
        }
    }

    #[test]
    fn builtin_types() {
        let map = OidMap::builtin();
        assert_eq!(map.len(), BUILTIN_TYPES.len());
        assert_eq!(map.oid_of("int4"), Some(Oid::from(23)));
        assert_eq!(map.oid_of("jsonb"), Some(Oid::from(3802)));

        let text = map.get(Oid::from(25)).unwrap();
        assert_eq!(text.name, "text");
        assert_eq!(text.size, TypeSize::Dynamic);
        assert!(text.builtin);

        let int8 = map.get(Oid::from(20)).unwrap();
        assert_eq!(int8.size, TypeSize::Fixed(8));
        assert!(!map.contains(Oid::from(0)));
    }

    #[test]
    fn register_and_set_type_oid() {
        let mut builder = OidMapBuilder::new();
        builder
            .register_type("hstore", TypeSize::Dynamic)
            .register_type("hstore", TypeSize::Fixed(4))
            .register_type("int4", TypeSize::Fixed(4));
        assert_eq!(builder.unresolved(), vec![String::from("hstore")]);

        // Unknown names are ignored
        builder.set_type_oid("ltree", Oid::from(90000)).unwrap();
        builder.set_type_oid("hstore", Oid::from(16385)).unwrap();
        assert!(builder.unresolved().is_empty());

        let map = builder.build().unwrap();
        let hstore = map.get(Oid::from(16385)).unwrap();
        assert_eq!(hstore.name, "hstore");
        assert_eq!(hstore.size, TypeSize::Dynamic);
        assert!(!hstore.builtin);
        assert_eq!(map.oid_of("ltree"), None);
    }

    #[test]
    fn set_type_oid_rejects_taken_oid() {
        let mut builder = OidMapBuilder::new();
        builder.register_type("hstore", TypeSize::Dynamic);

        match builder.set_type_oid("hstore", Oid::from(25)) {
            Err(Error::TypeOidConflict {
                name,
                oid,
                existing,
            }) => {
                assert_eq!(name, "hstore");
                assert_eq!(oid, 25);
                assert_eq!(existing, "text");
            }
            Err(e) => panic!("expected TypeOidConflict, got {:?}", e),
            Ok(_) => panic!("builtin oid reassigned"),
        }
        assert_eq!(builder.unresolved(), vec![String::from("hstore")]);

        builder.set_type_oid("hstore", Oid::from(16385)).unwrap();
        let map = builder.build().unwrap();
        assert_eq!(map.oid_of("text"), Some(Oid::from(25)));
        assert_eq!(map.get(Oid::from(25)).unwrap().name, "text");
        assert_eq!(map.len(), BUILTIN_TYPES.len() + 1);
    }

    #[test]
    fn populate_rejects_catalog_collision() {
        let mut conn = CatalogConnection {
            catalog: vec![
                (String::from("point2d"), Oid::from(16400)),
                (String::from("hstore"), Oid::from(16400)),
            ],
            fail: false,
        };
        let mut builder = OidMapBuilder::new();
        builder
            .register_type("point2d", TypeSize::Fixed(16))
            .register_type("hstore", TypeSize::Dynamic);

        match builder.populate(&mut conn) {
            Err(Error::TypeOidConflict { name, existing, .. }) => {
                assert_eq!(name, "hstore");
                assert_eq!(existing, "point2d");
            }
            other => panic!("expected TypeOidConflict, got {:?}", other),
        }
    }

    #[test]
    fn build_rejects_unresolved_types() {
        let builder = OidMapBuilder::from_custom_types(&[CustomType {
            name: String::from("point2d"),
            size: Some(16),
        }]);
        match builder.build() {
            Err(Error::UnresolvedType(name)) => assert_eq!(name, "point2d"),
            other => panic!("expected UnresolvedType, got {:?}", other),
        }
    }

    #[test]
    fn populate_from_catalog() {
        let mut conn = CatalogConnection {
            catalog: vec![
                (String::from("point2d"), Oid::from(16400)),
                (String::from("unused"), Oid::from(16401)),
            ],
            fail: false,
        };
        let builder = OidMapBuilder::from_custom_types(&[CustomType {
            name: String::from("point2d"),
            size: Some(16),
        }]);

        let map = builder.populate(&mut conn).unwrap();
        assert_eq!(map.oid_of("point2d"), Some(Oid::from(16400)));
        assert_eq!(
            map.get(Oid::from(16400)).unwrap().size,
            TypeSize::Fixed(16)
        );
        assert_eq!(map.oid_of("unused"), None);
        assert_eq!(map.len(), BUILTIN_TYPES.len() + 1);
    }

    #[test]
    fn populate_reports_catalog_errors() {
        let mut conn = CatalogConnection {
            catalog: Vec::new(),
            fail: true,
        };
        let mut builder = OidMapBuilder::new();
        builder.register_type("hstore", TypeSize::Dynamic);

        match builder.populate(&mut conn) {
            Err(Error::Driver(msg)) => assert_eq!(msg, "catalog gone"),
            other => panic!("expected Driver error, got {:?}", other),
        }

        // Nothing to resolve means the catalog is never consulted
        assert!(OidMapBuilder::new().populate(&mut conn).is_ok());
    }
}

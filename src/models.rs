pub mod file;
pub mod run;
pub mod user;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Field name to value mapping holding a resource's mutable state.
pub type Fields = Map<String, Value>;

/// Every resource kind the registry knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    User,
    File,
    Reporter,
    Assignment,
    Test,
    Submission,
    Run,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    List,
    Create,
    Get,
    Update,
    Delete,
    Relate,
}

/// Which fields a client may write for a kind.
#[derive(Debug)]
pub struct Schema {
    pub writable: &'static [&'static str],
    pub required: &'static [&'static str],
    /// Fields a client may only supply on create.
    pub create_only: &'static [&'static str],
}

/// A many-to-many edge set owned by `kind` pointing into `peer`.
///
/// `backref` names the reverse set kept on every peer, so deleting a peer can
/// find all the sets it appears in.
#[derive(Debug, PartialEq, Eq)]
pub struct Relation {
    pub kind: Kind,
    pub name: &'static str,
    pub peer: Kind,
    pub backref: &'static str,
}

pub const RELATIONS: &[Relation] = &[
    Relation {
        kind: Kind::Test,
        name: "files",
        peer: Kind::File,
        backref: "tests",
    },
    Relation {
        kind: Kind::Test,
        name: "reporters",
        peer: Kind::Reporter,
        backref: "tests",
    },
    Relation {
        kind: Kind::Submission,
        name: "files",
        peer: Kind::File,
        backref: "submissions",
    },
];

/// A parent to child containment set (an assignment's tests, a submission's runs).
#[derive(Debug, PartialEq, Eq)]
pub struct Children {
    pub parent: Kind,
    pub name: &'static str,
    pub child: Kind,
    /// Field on the child naming its parent.
    pub parent_field: &'static str,
}

pub const CHILDREN: &[Children] = &[
    Children {
        parent: Kind::Assignment,
        name: "tests",
        child: Kind::Test,
        parent_field: "assignment",
    },
    Children {
        parent: Kind::Assignment,
        name: "submissions",
        child: Kind::Submission,
        parent_field: "assignment",
    },
    Children {
        parent: Kind::Submission,
        name: "runs",
        child: Kind::Run,
        parent_field: "submission",
    },
];

impl Kind {
    pub const COLLECTIONS: [Kind; 6] = [
        Kind::File,
        Kind::Reporter,
        Kind::Assignment,
        Kind::Test,
        Kind::Submission,
        Kind::Run,
    ];

    /// Store namespace, also the collection's name in paths and response bodies.
    pub fn namespace(self) -> &'static str {
        match self {
            Kind::User => "users",
            Kind::File => "files",
            Kind::Reporter => "reporters",
            Kind::Assignment => "assignments",
            Kind::Test => "tests",
            Kind::Submission => "submissions",
            Kind::Run => "runs",
        }
    }

    pub fn from_collection(name: &str) -> Option<Kind> {
        Kind::COLLECTIONS
            .iter()
            .copied()
            .find(|kind| kind.namespace() == name)
    }

    pub fn schema(self) -> &'static Schema {
        match self {
            Kind::User | Kind::File => &Schema {
                writable: &[],
                required: &[],
                create_only: &[],
            },
            Kind::Reporter => &Schema {
                writable: &["mod", "target", "options"],
                required: &["mod"],
                create_only: &[],
            },
            Kind::Assignment => &Schema {
                writable: &["name", "env"],
                required: &["name"],
                create_only: &[],
            },
            Kind::Test => &Schema {
                writable: &["name", "tester", "maxscore"],
                required: &["name"],
                create_only: &[],
            },
            Kind::Submission => &Schema {
                writable: &["comments"],
                required: &[],
                create_only: &[],
            },
            Kind::Run => &Schema {
                writable: &[],
                required: &["test"],
                create_only: &["test"],
            },
        }
    }

    pub fn supports(self, operation: Operation) -> bool {
        match (self, operation) {
            (Kind::User, _) => false,
            (Kind::File, Operation::Update) | (Kind::Run, Operation::Update) => false,
            (Kind::Test, Operation::Relate) | (Kind::Submission, Operation::Relate) => true,
            (_, Operation::Relate) => false,
            _ => true,
        }
    }

    /// The containment set this kind is created under, if it isn't top level.
    pub fn parent(self) -> Option<&'static Children> {
        CHILDREN.iter().find(|children| children.child == self)
    }

    pub fn relation(self, name: &str) -> Option<&'static Relation> {
        RELATIONS
            .iter()
            .find(|relation| relation.kind == self && relation.name == name)
    }

    pub fn children(self, name: &str) -> Option<&'static Children> {
        CHILDREN
            .iter()
            .find(|children| children.parent == self && children.name == name)
    }

    /// Relations whose peer is this kind, i.e. sets this kind can appear in.
    pub fn referenced_by(self) -> impl Iterator<Item = &'static Relation> {
        RELATIONS.iter().filter(move |relation| relation.peer == self)
    }

    pub fn relations(self) -> impl Iterator<Item = &'static Relation> {
        RELATIONS.iter().filter(move |relation| relation.kind == self)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.namespace();
        f.write_str(&name[..name.len() - 1])
    }
}

/// The stored shape shared by every resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub owner: Option<Uuid>,
    pub fields: Fields,
}

impl Record {
    pub fn new(owner: Option<Uuid>, fields: Fields) -> Self {
        Record {
            id: Uuid::new_v4(),
            owner,
            fields,
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn field_uuid(&self, name: &str) -> Option<Uuid> {
        self.field_str(name).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Client facing rendition: the fields plus the owner.
    pub fn to_dict(&self) -> Value {
        let mut dict = self.fields.clone();
        dict.insert(
            "owner".into(),
            match self.owner {
                Some(owner) => Value::String(owner.to_string()),
                None => Value::Null,
            },
        );
        Value::Object(dict)
    }
}

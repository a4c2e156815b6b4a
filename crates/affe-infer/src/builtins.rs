//! The initial environment: primitive types and value schemes.
//!
//! Primitive scalar types live at the bottom of the kind lattice; arrays
//! are linear containers manipulated through borrows. Generic ids inside
//! the builtin schemes are scheme-local — instantiation maps them to
//! fresh variables, so small fixed ids are fine here.

use affe_ast::{Access, Name, NameSupply};
use affe_types::{
    Kind, KindBound, KindConst, KindScheme, KindVarId, Region, Type, TypeScheme, TypeVarId,
    Usage, Variance,
};

use crate::typeck::Env;

/// Names of the primitive type constructors.
#[derive(Debug, Clone)]
pub struct Prims {
    int: Name,
    boolean: Name,
    string: Name,
    unit: Name,
    array: Name,
}

impl Prims {
    pub fn int_type(&self) -> Type {
        Type::App(self.int.clone(), Vec::new())
    }

    pub fn bool_type(&self) -> Type {
        Type::App(self.boolean.clone(), Vec::new())
    }

    pub fn string_type(&self) -> Type {
        Type::App(self.string.clone(), Vec::new())
    }

    pub fn unit_type(&self) -> Type {
        Type::App(self.unit.clone(), Vec::new())
    }

    pub fn array_name(&self) -> &Name {
        &self.array
    }

    pub fn array_type(&self, element: Type) -> Type {
        Type::App(self.array.clone(), vec![element])
    }
}

fn un_arrow(param: Type, result: Type) -> Type {
    Type::arrow(param, Kind::un(Region::Global), result)
}

fn un_never() -> Kind {
    Kind::Const(KindConst::new(Usage::Un, Region::Never))
}

/// Build the initial environment, minting its names from the supply.
pub fn initial_env(supply: &mut NameSupply) -> Env {
    let prims = Prims {
        int: supply.fresh("int"),
        boolean: supply.fresh("bool"),
        string: supply.fresh("string"),
        unit: supply.fresh("unit"),
        array: supply.fresh("array"),
    };
    let mut env = Env::new(prims.clone());

    // Scalar primitives are unrestricted and global.
    for name in [&prims.int, &prims.boolean, &prims.string, &prims.unit] {
        env.add_type(name.clone(), KindScheme::constant(KindConst::BOTTOM));
    }

    // Arrays are linear: they must be freed exactly once, and are read
    // and written through borrows in between.
    env.add_type(
        prims.array.clone(),
        KindScheme {
            kind_vars: vec![KindVarId(0)],
            constraint: Vec::new(),
            params: vec![Kind::GenericVar(KindVarId(0))],
            variance: vec![Variance::Invar],
            result: Kind::lin(Region::Global),
        },
    );

    let int = prims.int_type();
    let boolean = prims.bool_type();
    let string = prims.string_type();
    let unit = prims.unit_type();

    for op in ["+", "-", "*", "/"] {
        env.add_value(
            supply.fresh(op),
            TypeScheme::mono(un_arrow(int.clone(), un_arrow(int.clone(), int.clone()))),
        );
    }
    for op in ["=", "<"] {
        env.add_value(
            supply.fresh(op),
            TypeScheme::mono(un_arrow(int.clone(), un_arrow(int.clone(), boolean.clone()))),
        );
    }
    env.add_value(
        supply.fresh("not"),
        TypeScheme::mono(un_arrow(boolean.clone(), boolean.clone())),
    );
    env.add_value(
        supply.fresh("concat"),
        TypeScheme::mono(un_arrow(string.clone(), un_arrow(string.clone(), string.clone()))),
    );

    let alpha = Type::GenericVar(TypeVarId(0));
    let k0 = KindVarId(0);
    let kb = KindVarId(1);

    // fix : ∀k ('a : k). k ≤ un@never => ('a -> 'a) -> 'a
    //
    // The recursive self-reference is shared, hence the unrestricted
    // bound on 'a.
    env.add_value(
        supply.fresh("fix"),
        TypeScheme {
            kind_vars: vec![k0],
            type_vars: vec![(TypeVarId(0), Kind::GenericVar(k0))],
            constraint: vec![KindBound::new(Kind::GenericVar(k0), un_never())],
            ty: un_arrow(un_arrow(alpha.clone(), alpha.clone()), alpha.clone()),
        },
    );

    // array_make : ∀k ('a : k). k ≤ un@never => int -> 'a -> array('a)
    env.add_value(
        supply.fresh("array_make"),
        TypeScheme {
            kind_vars: vec![k0],
            type_vars: vec![(TypeVarId(0), Kind::GenericVar(k0))],
            constraint: vec![KindBound::new(Kind::GenericVar(k0), un_never())],
            ty: un_arrow(
                int.clone(),
                un_arrow(alpha.clone(), prims.array_type(alpha.clone())),
            ),
        },
    );

    // array_get : ∀k kb ('a : k). k ≤ un@never => &{kb}(array('a)) -> int -> 'a
    env.add_value(
        supply.fresh("array_get"),
        TypeScheme {
            kind_vars: vec![k0, kb],
            type_vars: vec![(TypeVarId(0), Kind::GenericVar(k0))],
            constraint: vec![KindBound::new(Kind::GenericVar(k0), un_never())],
            ty: un_arrow(
                Type::borrow(
                    Access::Read,
                    Kind::GenericVar(kb),
                    prims.array_type(alpha.clone()),
                ),
                un_arrow(int.clone(), alpha.clone()),
            ),
        },
    );

    // array_set : ∀k kb ('a : k). &!{kb}(array('a)) -> int -> 'a -> unit
    env.add_value(
        supply.fresh("array_set"),
        TypeScheme {
            kind_vars: vec![k0, kb],
            type_vars: vec![(TypeVarId(0), Kind::GenericVar(k0))],
            constraint: Vec::new(),
            ty: un_arrow(
                Type::borrow(
                    Access::Write,
                    Kind::GenericVar(kb),
                    prims.array_type(alpha.clone()),
                ),
                un_arrow(int.clone(), un_arrow(alpha.clone(), unit.clone())),
            ),
        },
    );

    // array_free : ∀k ('a : k). array('a) -> unit
    env.add_value(
        supply.fresh("array_free"),
        TypeScheme {
            kind_vars: vec![k0],
            type_vars: vec![(TypeVarId(0), Kind::GenericVar(k0))],
            constraint: Vec::new(),
            ty: un_arrow(prims.array_type(alpha.clone()), unit.clone()),
        },
    );

    env
}

use proptest::prelude::*;

use crate::*;

#[test]
fn evaluate_variables() {
    let mut allocator = VariableAllocator::default();
    let x = allocator.fresh("x", 8);
    let y = allocator.fresh("y", 8);
    let (x_id, _) = x.as_variable().unwrap();
    let (y_id, _) = y.as_variable().unwrap();

    let mut eval = Evaluator::new(VariableAssignments::from_iter([(x_id, 200), (y_id, 100)]));
    assert_eq!(eval.evaluate(&x.clone().add(y.clone())), Some(44));
    assert_eq!(eval.evaluate_bool(&y.unsigned_less_than(x)), Some(true));
}

#[test]
fn unassigned_variable_is_unknown() {
    let mut allocator = VariableAllocator::default();
    let x = allocator.fresh("x", 8);
    let mut eval = Evaluator::default();
    assert_eq!(eval.evaluate(&x), None);
}

#[test]
fn ite_only_requires_selected_arm() {
    let mut allocator = VariableAllocator::default();
    let c = allocator.fresh("c", 1);
    let a = allocator.fresh("a", 8);
    let b = allocator.fresh("b", 8);
    let (c_id, _) = c.as_variable().unwrap();
    let (a_id, _) = a.as_variable().unwrap();

    let mut eval = Evaluator::new(VariableAssignments::from_iter([(c_id, 1), (a_id, 9)]));
    assert_eq!(eval.evaluate(&Expr::ite(c, a, b)), Some(9));
}

#[test]
fn assignment_is_truncated_to_variable_width() {
    let mut allocator = VariableAllocator::default();
    let x = allocator.fresh("x", 4);
    let (x_id, _) = x.as_variable().unwrap();
    let mut eval = Evaluator::new(VariableAssignments::from_iter([(x_id, 0xff)]));
    assert_eq!(eval.evaluate(&x), Some(0xf));
}

proptest! {
    #[test]
    fn folding_agrees_with_evaluation(a in any::<u8>(), b in any::<u8>(), shift in 0u8..10) {
        let mut allocator = VariableAllocator::default();
        let x = allocator.fresh("x", 8);
        let y = allocator.fresh("y", 8);
        let (x_id, _) = x.as_variable().unwrap();
        let (y_id, _) = y.as_variable().unwrap();

        let symbolic = x
            .clone()
            .add(y.clone())
            .xor(x.clone().shl(Expr::constant(shift.into(), 8)))
            .sub(y.clone().lshr(Expr::constant(1, 8)));
        let concrete = Expr::constant(a.into(), 8)
            .add(Expr::constant(b.into(), 8))
            .xor(Expr::constant(a.into(), 8).shl(Expr::constant(shift.into(), 8)))
            .sub(Expr::constant(b.into(), 8).lshr(Expr::constant(1, 8)));

        let mut eval = Evaluator::new(VariableAssignments::from_iter([
            (x_id, u64::from(a)),
            (y_id, u64::from(b)),
        ]));
        prop_assert_eq!(eval.evaluate(&symbolic), concrete.as_constant());
    }

    #[test]
    fn signed_compare_agrees_with_i8(a in any::<i8>(), b in any::<i8>()) {
        let lhs = Expr::constant(a as u8 as u64, 8);
        let rhs = Expr::constant(b as u8 as u64, 8);
        prop_assert_eq!(lhs.signed_less_than(rhs).as_bool(), Some(a < b));
    }
}

//! Environment-variable switches. Kept in their own binary because they
//! mutate process state.
use kirv_ir::expr::{self, Expr};
use kirv_ir::recognize::find_intrinsics_expr;
use kirv_ir::Type;
use pretty_assertions::assert_eq;

#[test]
fn recognizer_switches() {
    let wide = Type::i32(4);
    let a = expr::var(Type::i16(4), "a");
    let b = expr::var(Type::i16(4), "b");
    let input = expr::cast(wide, a.clone()) + expr::cast(wide, b.clone());

    // Disabled: the pass is the identity.
    std::env::set_var("HL_DISABLE_INTRINISICS", "1");
    assert_eq!(find_intrinsics_expr(&input), input);
    std::env::remove_var("HL_DISABLE_INTRINISICS");

    // Enabled (the default): the widening add is lifted.
    assert_eq!(
        find_intrinsics_expr(&input),
        expr::widening_add(a.clone(), b.clone())
    );

    // The rake bank is opt-in: max - min only folds to absd under the flag.
    let x = expr::var(Type::u8(8), "x");
    let y = expr::var(Type::u8(8), "y");
    let spread: Expr = expr::sub(
        expr::max(x.clone(), y.clone()),
        expr::min(x.clone(), y.clone()),
    );
    assert_eq!(find_intrinsics_expr(&spread), spread);
    std::env::set_var("HL_ENABLE_RAKE_RULES", "1");
    assert_eq!(find_intrinsics_expr(&spread), expr::absd(x, y));
    std::env::remove_var("HL_ENABLE_RAKE_RULES");
}

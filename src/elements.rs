const SYMBOLS: [&str; 119] = [
    "X", "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S",
    "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge",
    "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd",
    "In", "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd",
    "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg",
    "Tl", "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm",
    "Bk", "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn",
    "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Chemical symbol for an atomic number; `0` is the dummy species `X`.
pub fn symbol(number: i64) -> Option<&'static str> {
    usize::try_from(number)
        .ok()
        .and_then(|index| SYMBOLS.get(index))
        .copied()
}

pub fn atomic_number(symbol: &str) -> Option<i64> {
    SYMBOLS
        .iter()
        .position(|candidate| *candidate == symbol)
        .map(|index| index as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_both_ways() {
        assert_eq!(symbol(1), Some("H"));
        assert_eq!(symbol(8), Some("O"));
        assert_eq!(symbol(118), Some("Og"));
        assert_eq!(symbol(119), None);
        assert_eq!(symbol(-1), None);
        assert_eq!(atomic_number("C"), Some(6));
        assert_eq!(atomic_number("Zz"), None);
    }
}

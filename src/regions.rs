//! Static gazetteer of Chilean comunas and the lookup used to pull a canonical
//! comuna name out of free-form location text.

use std::collections::HashMap;

use once_cell::sync::Lazy;

const COMUNAS: &[&str] = &[
    // Arica y Parinacota
    "Arica", "Camarones", "General Lagos", "Putre",
    // Tarapacá
    "Alto Hospicio", "Camiña", "Colchane", "Huara", "Iquique", "Pica", "Pozo Almonte",
    // Antofagasta
    "Antofagasta", "Calama", "María Elena", "Mejillones", "Ollagüe", "San Pedro de Atacama",
    "Sierra Gorda", "Taltal", "Tocopilla",
    // Atacama
    "Alto del Carmen", "Caldera", "Chañaral", "Copiapó", "Diego de Almagro", "Freirina",
    "Huasco", "Tierra Amarilla", "Vallenar",
    // Coquimbo
    "Andacollo", "Canela", "Combarbalá", "Coquimbo", "Illapel", "La Higuera", "La Serena",
    "Los Vilos", "Monte Patria", "Ovalle", "Paihuano", "Punitaqui", "Río Hurtado", "Salamanca",
    "Vicuña",
    // Valparaíso
    "Algarrobo", "Cabildo", "Calle Larga", "Cartagena", "Casablanca", "Catemu", "Concón",
    "El Quisco", "El Tabo", "Hijuelas", "Isla de Pascua", "Juan Fernández", "La Calera",
    "La Cruz", "La Ligua", "Limache", "Llaillay", "Los Andes", "Nogales", "Olmué", "Panquehue",
    "Papudo", "Petorca", "Puchuncaví", "Putaendo", "Quillota", "Quilpué", "Quintero",
    "Rinconada", "San Antonio", "San Esteban", "San Felipe", "Santa María", "Santo Domingo",
    "Valparaíso", "Villa Alemana", "Viña del Mar", "Zapallar",
    // Metropolitana de Santiago
    "Alhué", "Buin", "Calera de Tango", "Cerrillos", "Cerro Navia", "Colina", "Conchalí",
    "Curacaví", "El Bosque", "El Monte", "Estación Central", "Huechuraba", "Independencia",
    "Isla de Maipo", "La Cisterna", "La Florida", "La Granja", "Lampa", "La Pintana",
    "La Reina", "Las Condes", "Lo Barnechea", "Lo Espejo", "Lo Prado", "Macul", "Maipú",
    "María Pinto", "Melipilla", "Ñuñoa", "Padre Hurtado", "Paine", "Pedro Aguirre Cerda",
    "Peñaflor", "Peñalolén", "Pirque", "Providencia", "Pudahuel", "Puente Alto", "Quilicura",
    "Quinta Normal", "Recoleta", "Renca", "San Bernardo", "San Joaquín", "San José de Maipo",
    "San Miguel", "San Pedro", "San Ramón", "Santiago", "Talagante", "Tiltil", "Vitacura",
    // Libertador Gral. Bernardo O'Higgins
    "Chépica", "Chimbarongo", "Codegua", "Coinco", "Coltauco", "Doñihue", "Graneros",
    "La Estrella", "Las Cabras", "Litueche", "Lolol", "Machalí", "Malloa", "Marchihue",
    "Mostazal", "Nancagua", "Navidad", "Olivar", "Palmilla", "Paredones", "Peralillo", "Peumo",
    "Pichidegua", "Pichilemu", "Placilla", "Pumanque", "Quinta de Tilcoco", "Rancagua", "Rengo",
    "Requínoa", "San Fernando", "Santa Cruz", "San Vicente",
    // Maule
    "Cauquenes", "Chanco", "Colbún", "Constitución", "Curepto", "Curicó", "Empedrado",
    "Hualañé", "Licantén", "Linares", "Longaví", "Maule", "Molina", "Parral", "Pelarco",
    "Pelluhue", "Pencahue", "Rauco", "Retiro", "Río Claro", "Romeral", "Sagrada Familia",
    "San Clemente", "San Javier", "San Rafael", "Talca", "Teno", "Vichuquén", "Villa Alegre",
    "Yerbas Buenas",
    // Ñuble
    "Bulnes", "Chillán", "Chillán Viejo", "Cobquecura", "Coelemu", "Coihueco", "El Carmen",
    "Ninhue", "Ñiquén", "Pemuco", "Pinto", "Portezuelo", "Quillón", "Quirihue", "Ránquil",
    "San Carlos", "San Fabián", "San Ignacio", "San Nicolás", "Treguaco", "Yungay",
    // Biobío
    "Alto Biobío", "Antuco", "Arauco", "Cabrero", "Cañete", "Chiguayante", "Concepción",
    "Contulmo", "Coronel", "Curanilahue", "Florida", "Hualpén", "Hualqui", "Laja", "Lebu",
    "Los Alamos", "Los Angeles", "Lota", "Mulchén", "Nacimiento", "Negrete", "Penco", "Quilaco",
    "Quilleco", "San Pedro de la Paz", "San Rosendo", "Santa Bárbara", "Santa Juana",
    "Talcahuano", "Tirúa", "Tomé", "Tucapel", "Yumbel",
    // La Araucanía
    "Angol", "Carahue", "Cholchol", "Collipulli", "Cunco", "Curacautín", "Curarrehue",
    "Ercilla", "Freire", "Galvarino", "Gorbea", "Lautaro", "Loncoche", "Lonquimay",
    "Los Sauces", "Lumaco", "Melipeuco", "Nueva Imperial", "Padre Las Casas", "Perquenco",
    "Pitrufquén", "Pucón", "Purén", "Renaico", "Saavedra", "Temuco", "Teodoro Schmidt",
    "Toltén", "Traiguén", "Victoria", "Vilcún", "Villarrica",
    // Los Ríos
    "Corral", "Futrono", "Lago Ranco", "Lanco", "La Unión", "Los Lagos", "Máfil", "Mariquina",
    "Paillaco", "Panguipulli", "Río Bueno", "Valdivia",
    // Los Lagos
    "Ancud", "Calbuco", "Castro", "Chaitén", "Chonchi", "Cochamó", "Curaco de Vélez",
    "Dalcahue", "Fresia", "Frutillar", "Futaleufú", "Hualaihué", "Llanquihue", "Los Muermos",
    "Maullín", "Osorno", "Palena", "Puerto Montt", "Puerto Octay", "Puerto Varas", "Puqueldón",
    "Purranque", "Puyehue", "Queilén", "Quellón", "Quemchi", "Quinchao", "Río Negro",
    "San Juan de la Costa", "San Pablo",
    // Aysén del G. Carlos Ibáñez del Campo
    "Aysén", "Chile Chico", "Cisnes", "Cochrane", "Coyhaique", "Guaitecas", "Lago Verde",
    "O'Higgins", "Río Ibáñez", "Tortel",
    // Magallanes y de la Antártica Chilena
    "Antártica", "Cabo de Hornos", "Laguna Blanca", "Natales", "Porvenir", "Primavera",
    "Punta Arenas", "Río Verde", "San Gregorio", "Timaukel", "Torres del Paine",
];

static INDEX: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    let mut index = HashMap::with_capacity(COMUNAS.len());
    for name in COMUNAS {
        index.entry(fold(name)).or_insert(*name);
    }
    index
});

/// Resolves free text such as `"Av. Grecia 1200, Ñuñoa, Santiago"` to a canonical
/// comuna name.
///
/// Comma-separated tokens are tried from the rightmost one backward; when none
/// matches, the whole string is tried as a single name. Matching ignores case,
/// diacritics and repeated whitespace.
pub fn resolve_region(text: &str) -> Option<&'static str> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    text.split(',')
        .rev()
        .map(fold)
        .filter(|token| !token.is_empty())
        .find_map(|token| INDEX.get(&token).copied())
        .or_else(|| INDEX.get(&fold(text)).copied())
}

pub fn is_known_region(name: &str) -> bool {
    INDEX.contains_key(&fold(name))
}

pub fn region_count() -> usize {
    COMUNAS.len()
}

fn fold(value: &str) -> String {
    let mut folded = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        if !folded.is_empty() {
            folded.push(' ');
        }
        folded.extend(word.chars().flat_map(char::to_lowercase).map(strip_accent));
    }
    folded
}

fn strip_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        other => other,
    }
}
